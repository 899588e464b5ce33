//! The flat record bpftrace prints for each event.
//!
//! A record is a JSON array: a record type followed by key/value pairs, e.g.
//!
//! ```text
//! ["track_event", "name", "page_fault_user", "type", "BEGIN", "ts", 100, "pid", 1, "tid", 2]
//! ```

use std::borrow::Cow;
use std::fmt;

use serde_json::Value;

use crate::error::{EncodeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    TrackDescriptor,
    TrackEvent,
    CallStack,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::TrackDescriptor => "track_descriptor",
            RecordKind::TrackEvent => "track_event",
            RecordKind::CallStack => "call_stack",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key/value pairs of a record in first-seen key order.
///
/// A repeated key overwrites the earlier value but keeps the earlier position,
/// so iteration order (and with it interning order) is deterministic.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Fields {
    entries: Vec<(String, Value)>,
}

impl Fields {
    pub fn insert(&mut self, key: String, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Required unsigned integer field.
    pub fn require_u64(&self, record: &'static str, key: &'static str) -> Result<u64> {
        let value = self.get(key).ok_or(EncodeError::MissingKey { record, key })?;
        value_as_u64(key, value)
    }

    /// Required pid/tid style field.
    pub fn require_i32(&self, record: &'static str, key: &'static str) -> Result<i32> {
        let value = self.get(key).ok_or(EncodeError::MissingKey { record, key })?;
        value_as_i32(key, value)
    }
}

/// A validated raw record: known kind and an even number of trailing fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    kind: RecordKind,
    values: Vec<Value>,
    fields: Fields,
}

impl RawRecord {
    /// Builds a record from the `data` member of a bpftrace `value` line.
    ///
    /// Returns `Ok(None)` for an empty array, which carries nothing to encode.
    pub fn from_value(data: &Value) -> Result<Option<Self>> {
        let values = match data.as_array() {
            Some(values) => values,
            None => return Err(EncodeError::NotAnArray(data.to_string())),
        };
        Self::from_values(values.clone())
    }

    pub fn from_values(values: Vec<Value>) -> Result<Option<Self>> {
        if values.is_empty() {
            return Ok(None);
        }

        let trailing = values.len() - 1;
        if trailing % 2 != 0 {
            return Err(EncodeError::UnpairedFields(trailing));
        }

        let kind = match values[0].as_str() {
            Some("track_descriptor") => RecordKind::TrackDescriptor,
            Some("track_event") => RecordKind::TrackEvent,
            Some("call_stack") => RecordKind::CallStack,
            _ => return Err(EncodeError::UnknownRecordKind(text(&values[0]).into_owned())),
        };

        let mut fields = Fields::default();
        for pair in values[1..].chunks_exact(2) {
            fields.insert(text(&pair[0]).into_owned(), pair[1].clone());
        }

        Ok(Some(RawRecord {
            kind,
            values,
            fields,
        }))
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Total number of elements, record type included.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Element at a fixed position, record type at 0.
    pub fn at(&self, position: usize) -> Option<&Value> {
        self.values.get(position)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }
}

/// Renders a value as plain text: strings without quotes, anything else as JSON.
pub fn text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}

pub fn value_as_u64(key: &str, value: &Value) -> Result<u64> {
    value.as_u64().ok_or_else(|| EncodeError::InvalidValue {
        key: key.to_string(),
        message: format!("expected a non-negative integer, got {value}"),
    })
}

pub fn value_as_u32(key: &str, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| EncodeError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a 32-bit unsigned integer, got {value}"),
        })
}

pub fn value_as_i32(key: &str, value: &Value) -> Result<i32> {
    value
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| EncodeError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a 32-bit integer, got {value}"),
        })
}

pub fn value_as_str<'a>(key: &str, value: &'a Value) -> Result<&'a str> {
    value.as_str().ok_or_else(|| EncodeError::InvalidValue {
        key: key.to_string(),
        message: format!("expected a string, got {value}"),
    })
}
