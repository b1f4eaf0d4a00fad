//! Turns raw message bodies into events.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("message body is a JSON {found}, expected an object")]
    NotAnObject { found: &'static str },
}

/// A single event: the top level JSON object of one message body.
///
/// Field values are kept as they arrived; nothing is checked against a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    fields: Map<String, Value>,
    /// Size of the body this event was decoded from
    encoded_len: usize,
}

impl DecodedEvent {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Length in bytes of the message body the event came from.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

/// Decode a message body. Has no side effects; the caller decides what to do with failures.
pub fn decode(body: &[u8]) -> Result<DecodedEvent, DecodeError> {
    match serde_json::from_slice(body)? {
        Value::Object(fields) => Ok(DecodedEvent {
            fields,
            encoded_len: body.len(),
        }),
        other => Err(DecodeError::NotAnObject {
            found: json_type(&other),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
