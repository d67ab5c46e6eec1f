//! Normalization of stored category payloads.
//!
//! Older schema versions wrapped collections as `{ "data": [...], ...meta }`.
//! Readers unwrap that envelope here, in one place, and writers only ever
//! persist the raw collection. Item shape is checked by [`ItemShape`] and
//! duplicate ids are dropped (first occurrence wins).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const ENVELOPE_FIELD: &str = "data";

/// Expected shape of one item in a category collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemShape {
    /// Plain non-empty strings
    Strings,
    /// Objects with a non-null `id` and a string `name`
    Records,
    /// Anything goes
    Any,
}

impl ItemShape {
    #[must_use]
    pub fn accepts(self, item: &Value) -> bool {
        match self {
            Self::Strings => item.as_str().is_some_and(|s| !s.trim().is_empty()),
            Self::Records => {
                item.get("id").is_some_and(|id| !id.is_null())
                    && item.get("name").is_some_and(Value::is_string)
            }
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("payload is not a collection (found {0})")]
    NotACollection(&'static str),
    #[error("item {index} does not match the {shape:?} shape")]
    InvalidItem { index: usize, shape: ItemShape },
}

/// A collection after envelope removal and de-duplication.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub items: Vec<Value>,
    pub was_wrapped: bool,
    pub duplicates_dropped: usize,
}

impl Normalized {
    /// Whether the stored form differs from what should be persisted.
    #[must_use]
    pub fn needs_rewrite(&self) -> bool {
        self.was_wrapped || self.duplicates_dropped > 0
    }
}

/// Strip one legacy envelope level if present.
#[must_use]
pub fn unwrap_envelope(value: Value) -> (Value, bool) {
    match value {
        Value::Object(mut map)
            if map
                .get(ENVELOPE_FIELD)
                .is_some_and(|d| d.is_array() || d.is_object()) =>
        {
            let payload = map.remove(ENVELOPE_FIELD).unwrap_or(Value::Null);
            (payload, true)
        }
        other => (other, false),
    }
}

/// Unwrap, validate and de-duplicate a stored category payload.
pub fn normalize(value: Value, shape: ItemShape) -> Result<Normalized, ShapeError> {
    let (payload, was_wrapped) = unwrap_envelope(value);
    let Value::Array(items) = payload else {
        return Err(ShapeError::NotACollection(kind_name(&payload)));
    };

    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(items.len());
    let mut duplicates_dropped = 0;
    for (index, item) in items.into_iter().enumerate() {
        if !shape.accepts(&item) {
            return Err(ShapeError::InvalidItem { index, shape });
        }
        if let Some(id) = item_identity(&item) {
            if !seen.insert(id) {
                duplicates_dropped += 1;
                continue;
            }
        }
        kept.push(item);
    }

    Ok(Normalized {
        items: kept,
        was_wrapped,
        duplicates_dropped,
    })
}

/// Identity of a record item; strings and id-less values have none.
fn item_identity(item: &Value) -> Option<String> {
    match item.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
