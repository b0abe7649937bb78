//! JSON codec between wire payloads and typed records
//!
//! All serialization goes through [`MessageCodec`] so that a change in wire
//! format stays inside this module.

use super::messages::{ControlMessage, TaskMessage};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Payload is not a JSON object")]
    NotAnObject,
}

/// Stateless encoder/decoder for bus payloads
pub struct MessageCodec;

impl MessageCodec {
    /// Serialize any wire record into a payload
    pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(CodecError::Encode)
    }

    /// Deserialize a payload into a wire record
    pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(payload).map_err(CodecError::Decode)
    }

    /// Decode an inbound task. Only non-objects and malformed JSON fail here.
    ///
    /// Fields are read leniently: a numeric `taskId` is taken in its decimal
    /// form and a `null` `parameters` counts as empty. A wrongly typed `type`
    /// or `parameters` is recorded in [`TaskMessage::malformed`] so the task
    /// can still be answered on its result subject.
    pub fn decode_task(payload: &[u8]) -> Result<TaskMessage, CodecError> {
        let value: Value = Self::decode(payload)?;
        let Value::Object(mut fields) = value else {
            return Err(CodecError::NotAnObject);
        };

        let task_id = match fields.remove("taskId") {
            Some(Value::String(id)) => Some(id),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let mut malformed = None;
        let task_type = match fields.remove("type") {
            Some(Value::String(t)) => Some(t),
            None | Some(Value::Null) => None,
            Some(other) => {
                malformed = Some(format!("Task type must be a string, got {}", json_kind(&other)));
                None
            }
        };

        let parameters = match fields.remove("parameters") {
            Some(Value::Object(map)) => map,
            None | Some(Value::Null) => Map::new(),
            Some(other) => {
                malformed.get_or_insert_with(|| {
                    format!("Task parameters must be an object, got {}", json_kind(&other))
                });
                Map::new()
            }
        };

        Ok(TaskMessage {
            task_id,
            task_type,
            parameters,
            malformed,
        })
    }

    pub fn decode_control(payload: &[u8]) -> Result<ControlMessage, CodecError> {
        Self::decode(payload)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
