//! JSON codec adapter.
//!
//! Documents cross the SQL boundary as JSON text: the engine hands the
//! backend `jsonb(@p)` on writes and selects `json(body)` on reads, so the
//! Rust side only ever sees text. Property naming follows whatever serde
//! attributes the document type declares; schema field paths must match the
//! encoded names.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FractalError, Result};
use crate::value::Value;

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| FractalError::Serialization {
        field: None,
        message: format!("could not encode document: {}", e),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| FractalError::Serialization {
        field: None,
        message: format!("could not decode document: {}", e),
    })
}

pub(crate) fn decode_json(text: &str) -> Result<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| FractalError::Serialization {
        field: None,
        message: format!("could not decode document body: {}", e),
    })
}

pub(crate) fn from_json_value<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| FractalError::Serialization {
        field: None,
        message: format!("could not decode document: {}", e),
    })
}

/// Extracts the scalar at a dotted path (`a.b.c`) from encoded JSON text.
/// Missing segments yield `Value::Null`.
pub(crate) fn decode_value(text: &str, path: &str) -> Result<Value> {
    let root = decode_json(text)?;
    let mut cursor = &root;
    for segment in path.split('.') {
        match cursor.get(segment) {
            Some(next) => cursor = next,
            None => return Ok(Value::Null),
        }
    }
    Ok(Value::from_json(cursor))
}
