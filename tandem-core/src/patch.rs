//! Keyed three-way diffs over a document.
//!
//! A [`Patch`] lists records that were added, updated (`from`, `to`) or
//! removed. An id appears in at most one of the three sections.
//!
//! Wire form (JSON):
//! ```text
//! {
//!   "added":   { "<id>": <record>, ... },
//!   "updated": { "<id>": [<from>, <to>], ... },
//!   "removed": { "<id>": <record>, ... }
//! }
//! ```
//!
//! Inbound patches arrive as [`RawPatch`] and are decoded entry by entry,
//! so one malformed record never discards the rest of the patch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

use crate::record::{Record, RecordId};

/// Reasons a patch entry is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("record {id} could not be decoded: {reason}")]
    Decode { id: String, reason: String },
    #[error("record keyed {key} carries id {actual}")]
    KeyMismatch { key: String, actual: String },
    #[error("record {0} appears in more than one patch section")]
    DuplicateId(String),
    #[error("record has no string id")]
    MissingId,
    #[error("patch could not be encoded: {0}")]
    Encode(String),
}

/// Patch section an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Added,
    Updated,
    Removed,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => f.write_str("added"),
            Self::Updated => f.write_str("updated"),
            Self::Removed => f.write_str("removed"),
        }
    }
}

/// A skipped patch entry and why it was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchAnomaly {
    pub section: Section,
    pub key: String,
    pub reason: PatchError,
}

impl fmt::Display for PatchAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} entry {}: {}", self.section, self.key, self.reason)
    }
}

/// Typed keyed diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch<R> {
    #[serde(default = "BTreeMap::new")]
    pub added: BTreeMap<RecordId, R>,
    #[serde(default = "BTreeMap::new")]
    pub updated: BTreeMap<RecordId, (R, R)>,
    #[serde(default = "BTreeMap::new")]
    pub removed: BTreeMap<RecordId, R>,
}

impl<R> Default for Patch<R> {
    fn default() -> Self {
        Self {
            added: BTreeMap::new(),
            updated: BTreeMap::new(),
            removed: BTreeMap::new(),
        }
    }
}

impl<R: Record> Patch<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the patch that turns `previous` into `current`.
    pub fn diff(previous: &BTreeMap<RecordId, R>, current: &BTreeMap<RecordId, R>) -> Self {
        let mut patch = Self::new();

        for (id, record) in current {
            match previous.get(id) {
                None => {
                    patch.added.insert(id.clone(), record.clone());
                }
                Some(before) if before != record => {
                    patch
                        .updated
                        .insert(id.clone(), (before.clone(), record.clone()));
                }
                Some(_) => {}
            }
        }

        for (id, record) in previous {
            if !current.contains_key(id) {
                patch.removed.insert(id.clone(), record.clone());
            }
        }

        patch
    }

    /// Record `record` as added. Clears the id from the other sections.
    pub fn with_added(mut self, record: R) -> Self {
        let id = record.id().clone();
        self.updated.remove(&id);
        self.removed.remove(&id);
        self.added.insert(id, record);
        self
    }

    pub fn with_updated(mut self, from: R, to: R) -> Self {
        let id = to.id().clone();
        self.added.remove(&id);
        self.removed.remove(&id);
        self.updated.insert(id, (from, to));
        self
    }

    pub fn with_removed(mut self, record: R) -> Self {
        let id = record.id().clone();
        self.added.remove(&id);
        self.updated.remove(&id);
        self.removed.insert(id, record);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Total number of entries across all sections.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.added
            .keys()
            .chain(self.updated.keys())
            .chain(self.removed.keys())
    }

    pub fn touches(&self, id: &str) -> bool {
        self.added.contains_key(id) || self.updated.contains_key(id) || self.removed.contains_key(id)
    }

    /// Encode into the untyped wire form.
    pub fn to_raw(&self) -> Result<RawPatch, PatchError> {
        match serde_json::to_value(self) {
            Ok(value) => serde_json::from_value(value).map_err(|e| PatchError::Encode(e.to_string())),
            Err(e) => Err(PatchError::Encode(e.to_string())),
        }
    }
}

/// Untyped patch as received from the channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPatch {
    #[serde(default)]
    pub added: Map<String, Value>,
    #[serde(default)]
    pub updated: Map<String, Value>,
    #[serde(default)]
    pub removed: Map<String, Value>,
}

impl RawPatch {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Decode every entry independently.
    ///
    /// Entries that fail to decode, whose record id disagrees with the map
    /// key, or whose id was already seen in an earlier section (order:
    /// added, updated, removed) are skipped and reported.
    pub fn decode<R: Record>(&self) -> (Patch<R>, Vec<PatchAnomaly>) {
        let mut patch = Patch::new();
        let mut anomalies = Vec::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();

        for (key, value) in &self.added {
            match decode_entry::<R>(key, value, &seen) {
                Ok(record) => {
                    seen.insert(key.as_str());
                    patch.added.insert(record.id().clone(), record);
                }
                Err(reason) => anomalies.push(anomaly(Section::Added, key, reason)),
            }
        }

        for (key, value) in &self.updated {
            match decode_update::<R>(key, value, &seen) {
                Ok((from, to)) => {
                    seen.insert(key.as_str());
                    patch.updated.insert(to.id().clone(), (from, to));
                }
                Err(reason) => anomalies.push(anomaly(Section::Updated, key, reason)),
            }
        }

        for (key, value) in &self.removed {
            match decode_entry::<R>(key, value, &seen) {
                Ok(record) => {
                    seen.insert(key.as_str());
                    patch.removed.insert(record.id().clone(), record);
                }
                Err(reason) => anomalies.push(anomaly(Section::Removed, key, reason)),
            }
        }

        for a in &anomalies {
            log::warn!("Skipping patch entry: {a}");
        }

        (patch, anomalies)
    }
}

fn anomaly(section: Section, key: &str, reason: PatchError) -> PatchAnomaly {
    PatchAnomaly {
        section,
        key: key.to_string(),
        reason,
    }
}

fn decode_entry<R: Record>(key: &str, value: &Value, seen: &BTreeSet<&str>) -> Result<R, PatchError> {
    if seen.contains(key) {
        return Err(PatchError::DuplicateId(key.to_string()));
    }
    let record: R = serde_json::from_value(value.clone()).map_err(|e| PatchError::Decode {
        id: key.to_string(),
        reason: e.to_string(),
    })?;
    check_key(key, &record)?;
    Ok(record)
}

fn decode_update<R: Record>(
    key: &str,
    value: &Value,
    seen: &BTreeSet<&str>,
) -> Result<(R, R), PatchError> {
    if seen.contains(key) {
        return Err(PatchError::DuplicateId(key.to_string()));
    }
    let (from, to): (R, R) = serde_json::from_value(value.clone()).map_err(|e| PatchError::Decode {
        id: key.to_string(),
        reason: e.to_string(),
    })?;
    check_key(key, &from)?;
    check_key(key, &to)?;
    Ok((from, to))
}

fn check_key<R: Record>(key: &str, record: &R) -> Result<(), PatchError> {
    if record.id().as_str() != key {
        return Err(PatchError::KeyMismatch {
            key: key.to_string(),
            actual: record.id().to_string(),
        });
    }
    Ok(())
}
