//! Addressable records and their identifiers.
//!
//! Every shared document is a flat map from [`RecordId`] to a record type
//! implementing [`Record`]. Ids are stable across edits: renaming or moving
//! a record never changes its id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Globally unique (per document) record identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id, optionally namespaced (`shape:<uuid>`).
    pub fn generate(prefix: &str) -> Self {
        let id = Uuid::new_v4();
        if prefix.is_empty() {
            Self(id.to_string())
        } else {
            Self(format!("{prefix}:{id}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace prefix before the first `:`, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.0.split_once(':').map(|(prefix, _)| prefix)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RecordId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A value addressable by id inside a document.
pub trait Record:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + 'static
{
    fn id(&self) -> &RecordId;
}
