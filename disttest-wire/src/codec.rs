// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text encoding for frames.
//!
//! Each frame is one line of JSON. `serde_json` escapes newlines inside
//! strings, so an encoded frame never contains a raw `\n` and can be written
//! to a line-oriented stream as is.

use crate::{ControllerMessage, DecodeError, EncodeError, OutcomeKind, WorkerMessage};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Encodes a worker message as a single line of text (without the trailing
/// newline).
pub fn encode_worker_message(message: &WorkerMessage) -> Result<String, EncodeError> {
    encode(message, message.type_tag())
}

/// Decodes a worker message from a single line of text.
///
/// Unknown message types and unknown outcome kinds are rejected.
pub fn decode_worker_message(frame: &str) -> Result<WorkerMessage, DecodeError> {
    let envelope = Envelope::parse(frame, WorkerMessage::TYPE_TAGS)?;
    if envelope.message_type == "outcome" {
        let kind = envelope
            .value
            .get("outcome")
            .and_then(|outcome| outcome.get("kind"))
            .and_then(Value::as_str);
        match kind {
            Some(kind) if OutcomeKind::from_tag(kind).is_some() => {}
            other => {
                return Err(DecodeError::UnknownOutcomeKind {
                    kind: other.map(str::to_owned),
                    seq: envelope.seq,
                });
            }
        }
    }
    envelope.finish()
}

/// Encodes a controller message as a single line of text (without the
/// trailing newline).
pub fn encode_controller_message(message: &ControllerMessage) -> Result<String, EncodeError> {
    encode(message, message.type_tag())
}

/// Decodes a controller message from a single line of text.
pub fn decode_controller_message(frame: &str) -> Result<ControllerMessage, DecodeError> {
    Envelope::parse(frame, ControllerMessage::TYPE_TAGS)?.finish()
}

fn encode<T: Serialize>(message: &T, message_type: &'static str) -> Result<String, EncodeError> {
    serde_json::to_string(message).map_err(|error| EncodeError::new(message_type, error))
}

/// A frame whose `type` tag has been checked but which hasn't been
/// deserialized yet.
struct Envelope {
    value: Value,
    message_type: String,
    seq: Option<u64>,
}

impl Envelope {
    fn parse(frame: &str, known_types: &[&str]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(frame).map_err(DecodeError::Json)?;
        let seq = value.get("seq").and_then(Value::as_u64);
        let Some(message_type) = value.get("type").and_then(Value::as_str) else {
            return Err(DecodeError::MissingType { seq });
        };
        if !known_types.contains(&message_type) {
            return Err(DecodeError::UnknownMessageType {
                message_type: message_type.to_owned(),
                seq,
            });
        }

        let message_type = message_type.to_owned();
        Ok(Self {
            value,
            message_type,
            seq,
        })
    }

    fn finish<T: DeserializeOwned>(self) -> Result<T, DecodeError> {
        let Self {
            value,
            message_type,
            seq,
        } = self;
        serde_json::from_value(value).map_err(|error| DecodeError::Malformed {
            message_type,
            seq,
            error,
        })
    }
}
