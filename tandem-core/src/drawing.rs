//! Shared drawing scene.
//!
//! Drawing records are opaque JSON objects owned by the canvas engine.
//! The only fields this crate relies on are the string `id` and, for
//! classification, `typeName`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::patch::{Patch, PatchError};
use crate::record::{Record, RecordId};
use crate::replica::{Origin, Replica};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Shape,
    Page,
    Asset,
    Other,
}

impl RecordKind {
    fn from_name(name: &str) -> Self {
        match name {
            "shape" => RecordKind::Shape,
            "page" => RecordKind::Page,
            "asset" => RecordKind::Asset,
            _ => RecordKind::Other,
        }
    }
}

/// A canvas record: an object with at least a string `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct DrawingRecord {
    id: RecordId,
    body: Map<String, Value>,
}

impl TryFrom<Map<String, Value>> for DrawingRecord {
    type Error = PatchError;

    fn try_from(body: Map<String, Value>) -> Result<Self, Self::Error> {
        let id = match body.get("id") {
            Some(Value::String(id)) => RecordId::new(id.clone()),
            _ => return Err(PatchError::MissingId),
        };
        Ok(Self { id, body })
    }
}

impl From<DrawingRecord> for Map<String, Value> {
    fn from(record: DrawingRecord) -> Self {
        record.body
    }
}

impl Record for DrawingRecord {
    fn id(&self) -> &RecordId {
        &self.id
    }
}

impl DrawingRecord {
    /// New record with the given id and `typeName`.
    pub fn new(id: impl Into<RecordId>, type_name: &str) -> Self {
        let id = id.into();
        let mut body = Map::new();
        body.insert("id".into(), Value::String(id.to_string()));
        body.insert("typeName".into(), Value::String(type_name.to_string()));
        Self { id, body }
    }

    pub fn from_value(value: Value) -> Result<Self, PatchError> {
        match value {
            Value::Object(body) => Self::try_from(body),
            _ => Err(PatchError::MissingId),
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        self.body.get("typeName").and_then(Value::as_str)
    }

    /// Classify by `typeName`, falling back to the id prefix (`shape:…`).
    pub fn kind(&self) -> RecordKind {
        match self.type_name() {
            Some(name) => RecordKind::from_name(name),
            None => self
                .id
                .prefix()
                .map(RecordKind::from_name)
                .unwrap_or(RecordKind::Other),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    /// Set a field. The `id` field is fixed and cannot be overwritten.
    pub fn set(&mut self, field: &str, value: Value) -> bool {
        if field == "id" {
            return false;
        }
        self.body.insert(field.to_string(), value);
        true
    }

    pub fn with(mut self, field: &str, value: Value) -> Self {
        self.set(field, value);
        self
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }
}

/// Drawing replica with per-kind views.
#[derive(Debug, Default)]
pub struct DrawingScene {
    replica: Replica<DrawingRecord>,
}

impl DrawingScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replica(&self) -> &Replica<DrawingRecord> {
        &self.replica
    }

    pub fn replica_mut(&mut self) -> &mut Replica<DrawingRecord> {
        &mut self.replica
    }

    pub fn apply(&mut self, patch: &Patch<DrawingRecord>, origin: Origin) {
        self.replica.apply(patch, origin);
    }

    pub fn of_kind(&self, kind: RecordKind) -> impl Iterator<Item = &DrawingRecord> {
        self.replica.iter().filter(move |r| r.kind() == kind)
    }

    pub fn shapes(&self) -> impl Iterator<Item = &DrawingRecord> {
        self.of_kind(RecordKind::Shape)
    }

    pub fn pages(&self) -> impl Iterator<Item = &DrawingRecord> {
        self.of_kind(RecordKind::Page)
    }

    pub fn assets(&self) -> impl Iterator<Item = &DrawingRecord> {
        self.of_kind(RecordKind::Asset)
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.of_kind(kind).count()
    }

    pub fn reset(&mut self) {
        self.replica.reset();
    }
}
