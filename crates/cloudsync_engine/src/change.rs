//! Change records exchanged between the local and remote stores.

use crate::value::{Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Record was created.
    Create,
    /// Record was updated.
    Update,
    /// Record was deleted.
    Delete,
}

/// One mutation to one logical record.
///
/// Built once and never mutated; the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    record_id: String,
    record_type: String,
    action: ChangeAction,
    fields: BTreeMap<String, Value>,
    timestamp: Timestamp,
}

impl SyncChange {
    /// Creates a change with no fields.
    pub fn new(
        record_id: impl Into<String>,
        record_type: impl Into<String>,
        action: ChangeAction,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            record_type: record_type.into(),
            action,
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Creates a `Create` change.
    pub fn create(
        record_id: impl Into<String>,
        record_type: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self::new(record_id, record_type, ChangeAction::Create, timestamp)
    }

    /// Creates an `Update` change.
    pub fn update(
        record_id: impl Into<String>,
        record_type: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self::new(record_id, record_type, ChangeAction::Update, timestamp)
    }

    /// Creates a `Delete` change.
    pub fn delete(
        record_id: impl Into<String>,
        record_type: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self::new(record_id, record_type, ChangeAction::Delete, timestamp)
    }

    /// Adds or replaces a field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Replaces all fields.
    pub fn with_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        self.fields = fields;
        self
    }

    /// Returns the record identifier.
    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    /// Returns the record type.
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    /// Returns the action.
    pub fn action(&self) -> ChangeAction {
        self.action
    }

    /// Returns the changed fields.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Returns a single field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns when the change was made.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns true if this change deletes the record.
    pub fn is_delete(&self) -> bool {
        self.action == ChangeAction::Delete
    }

    /// Returns true if this change already carries everything `write` wrote:
    /// same record, timestamp and action, and each of its fields with an
    /// equal value.
    ///
    /// A pulled record that includes a pushed change is that push's echo.
    pub fn includes(&self, write: &SyncChange) -> bool {
        self.record_id == write.record_id
            && self.timestamp == write.timestamp
            && self.action == write.action
            && write
                .fields
                .iter()
                .all(|(key, value)| self.fields.get(key) == Some(value))
    }
}
