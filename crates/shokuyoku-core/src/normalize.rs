//! Payload normalization and record routing.
//!
//! Payloads are JSON objects. Nested objects flatten into dotted paths
//! (`user.id`), arrays use the element index as a path segment
//! (`tags.0`), and scalars pass through. Empty containers contribute no
//! keys. When two paths collapse to the same key (a literal `"a.b"` next to
//! `{"a":{"b":..}}`), the value visited last wins.

use crate::error::PayloadError;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::fmt;

/// A single-level record of dotted field paths to scalar values.
pub type FlatRecord = Map<String, Value>;

/// Field that carries the event time.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Field that must be present for a record to be kept.
pub const EVENT_FIELD: &str = "event";

/// Routing key for an event buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    /// Event type taken from the frame
    pub event_type: String,
    /// Calendar date taken from the record timestamp
    pub date: NaiveDate,
}

impl PartitionKey {
    pub fn new(event_type: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            event_type: event_type.into(),
            date,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.event_type, self.date.format("%Y-%m-%d"))
    }
}

/// Why a normalized record was not routed to a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRejection {
    MissingTimestamp,
    MissingEvent,
    /// Timestamp present but its first 10 characters are not `YYYY-MM-DD`
    InvalidTimestamp(String),
}

impl RecordRejection {
    /// Short label used in logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            RecordRejection::MissingTimestamp => "missing_timestamp",
            RecordRejection::MissingEvent => "missing_event",
            RecordRejection::InvalidTimestamp(_) => "invalid_timestamp",
        }
    }
}

impl fmt::Display for RecordRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRejection::MissingTimestamp => write!(f, "record has no timestamp"),
            RecordRejection::MissingEvent => write!(f, "record has no event"),
            RecordRejection::InvalidTimestamp(ts) => {
                write!(f, "timestamp {:?} does not start with a date", ts)
            }
        }
    }
}

/// Parse a payload and flatten it into a [`FlatRecord`].
pub fn normalize(payload: &[u8]) -> Result<FlatRecord, PayloadError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;

    match value {
        Value::Object(map) => Ok(flatten(map)),
        other => Err(PayloadError::NotAnObject(type_name(&other))),
    }
}

/// Flatten a JSON object. A map that is already flat comes back unchanged.
pub fn flatten(object: Map<String, Value>) -> FlatRecord {
    let mut out = FlatRecord::new();
    for (key, value) in object {
        flatten_into(key, value, &mut out);
    }
    out
}

fn flatten_into(path: String, value: Value, out: &mut FlatRecord) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(format!("{}.{}", path, key), child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.into_iter().enumerate() {
                flatten_into(format!("{}.{}", path, index), child, out);
            }
        }
        scalar => {
            out.insert(path, scalar);
        }
    }
}

/// Check required fields and derive the routing key.
///
/// The event type comes from the frame; the record only has to carry an
/// `event` field.
pub fn partition_key(event_type: &str, record: &FlatRecord) -> Result<PartitionKey, RecordRejection> {
    let timestamp = match record.get(TIMESTAMP_FIELD) {
        None | Some(Value::Null) => return Err(RecordRejection::MissingTimestamp),
        Some(Value::String(ts)) => ts,
        Some(other) => return Err(RecordRejection::InvalidTimestamp(other.to_string())),
    };

    if matches!(record.get(EVENT_FIELD), None | Some(Value::Null)) {
        return Err(RecordRejection::MissingEvent);
    }

    let date = timestamp
        .get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        .ok_or_else(|| RecordRejection::InvalidTimestamp(timestamp.clone()))?;

    Ok(PartitionKey::new(event_type, date))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
