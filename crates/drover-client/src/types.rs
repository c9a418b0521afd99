//! Record and request types for drover-client
//!
//! The record model is deliberately small: a record is a bag of named field
//! values plus an optional service-assigned id. Requests and responses mirror
//! the bulk verbs the record service exposes, including the container request
//! used for entities that cannot take multi-record payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single field value on a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum FieldValue {
    /// Absent / cleared value
    Null,
    /// Boolean flag
    Bool(bool),
    /// Whole number
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Text value
    Text(String),
    /// Link to another record
    Reference { entity: String, id: String },
}

impl FieldValue {
    /// Check if the value is null
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to read as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// Try to read as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Try to read as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(n) => Some(*n),
            Self::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Try to read as text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to read as a reference, returning `(entity, id)`
    pub fn as_reference(&self) -> Option<(&str, &str)> {
        match self {
            Self::Reference { entity, id } => Some((entity, id)),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// A record to create, update, upsert, or delete
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    /// Service-assigned id; required for updates and deletes
    pub id: Option<String>,
    /// Named field values, kept sorted for stable serialization
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create an empty record without an id
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty record with a known id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            fields: BTreeMap::new(),
        }
    }

    /// Set a field value
    pub fn set(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Set a reference field pointing at another record
    pub fn reference(
        mut self,
        field: impl Into<String>,
        entity: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        self.fields.insert(
            field.into(),
            FieldValue::Reference {
                entity: entity.into(),
                id: id.into(),
            },
        );
        self
    }

    /// Get a field value
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Iterate reference fields as `(field, entity, id)`
    pub fn references(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.fields.iter().filter_map(|(name, value)| {
            value
                .as_reference()
                .map(|(entity, id)| (name.as_str(), entity, id))
        })
    }
}

/// The bulk verb to apply to every record in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OperationKind {
    /// Insert new records; the service assigns ids
    #[default]
    Create,
    /// Modify existing records in place
    Update,
    /// Insert-or-update keyed on the record id
    Upsert,
    /// Remove existing records
    Delete,
}

impl OperationKind {
    /// Updates and deletes address existing records, so every input must
    /// carry an id.
    #[inline]
    pub const fn requires_ids(self) -> bool {
        matches!(self, Self::Update | Self::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Upsert => write!(f, "upsert"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// How the target entity handles multi-record payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntityKind {
    /// Entity accepts native multi-record requests
    #[default]
    MultiRecordCapable,
    /// Entity only accepts one record per request; bulk work goes through
    /// aggregated containers
    SequentialOnly,
}

impl EntityKind {
    /// Whether a native multi-record request can target this entity
    #[inline]
    pub const fn supports_multi_record(self) -> bool {
        matches!(self, Self::MultiRecordCapable)
    }
}

/// A request sent over a record-service connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordRequest {
    /// Create a batch of records in one call
    CreateMultiple {
        /// Target entity name
        entity: String,
        /// Records to create
        records: Vec<Record>,
    },
    /// Update a batch of records in one call
    UpdateMultiple {
        /// Target entity name
        entity: String,
        /// Records to update; each must carry an id
        records: Vec<Record>,
    },
    /// Upsert a batch of records in one call
    UpsertMultiple {
        /// Target entity name
        entity: String,
        /// Records to upsert
        records: Vec<Record>,
    },
    /// Delete a batch of records by id in one call
    DeleteMultiple {
        /// Target entity name
        entity: String,
        /// Ids of the records to delete
        ids: Vec<String>,
    },
    /// Execute several requests as one aggregated call
    ExecuteContainer {
        /// Requests to run inside the container
        requests: Vec<RecordRequest>,
        /// Keep running remaining items after one fails
        continue_on_error: bool,
    },
    /// Liveness probe used by connection validation
    Ping,
}

impl RecordRequest {
    /// Number of records the request touches; containers sum their children
    pub fn record_count(&self) -> usize {
        match self {
            Self::CreateMultiple { records, .. }
            | Self::UpdateMultiple { records, .. }
            | Self::UpsertMultiple { records, .. } => records.len(),
            Self::DeleteMultiple { ids, .. } => ids.len(),
            Self::ExecuteContainer { requests, .. } => {
                requests.iter().map(RecordRequest::record_count).sum()
            }
            Self::Ping => 0,
        }
    }

    /// Request kind for log lines
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::CreateMultiple { .. } => "create_multiple",
            Self::UpdateMultiple { .. } => "update_multiple",
            Self::UpsertMultiple { .. } => "upsert_multiple",
            Self::DeleteMultiple { .. } => "delete_multiple",
            Self::ExecuteContainer { .. } => "execute_container",
            Self::Ping => "ping",
        }
    }
}

/// A response from a record-service connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordResponse {
    /// Ids assigned to created records, in input order
    Created {
        /// One id per created record
        ids: Vec<String>,
    },
    /// Number of records updated
    Updated {
        /// Update count reported by the service
        count: u64,
    },
    /// Per-record upsert outcomes, in input order
    Upserted {
        /// One outcome per input record
        outcomes: Vec<UpsertOutcome>,
    },
    /// Number of records deleted
    Deleted {
        /// Delete count reported by the service
        count: u64,
    },
    /// Per-item outcomes of an aggregated container call, in input order
    Container {
        /// One outcome per container item
        outcomes: Vec<ItemOutcome>,
    },
    /// Liveness probe reply
    Pong,
}

/// Outcome of a single upserted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    /// Id of the affected record
    pub id: String,
    /// True when the upsert created the record, false when it updated it
    pub created: bool,
}

/// Outcome of one item inside an aggregated container call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    /// Item succeeded
    Success {
        /// Id assigned or affected, when the service reports one
        id: Option<String>,
    },
    /// Item failed
    Failed {
        /// Failure message reported by the service
        message: String,
    },
}

impl ItemOutcome {
    /// Whether the item succeeded
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}
