use crate::protocol::{InboundMessage, is_recognized_type};
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

/// Reasons an inbound frame is discarded.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("text frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("message has no string `type` field")]
    MissingType,
    #[error("malformed `{message_type}` message: {reason}")]
    Malformed {
        message_type: String,
        reason: String,
    },
}

/// Where an inbound frame goes after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// A recognized control message.
    Control(InboundMessage),
    /// JSON with a `type` this crate does not know. Forwarded unchanged.
    Passthrough(Value),
    /// Opaque audio, byte-for-byte as received.
    Audio(Bytes),
    /// Undecodable control traffic. Logged and dropped by the caller.
    Malformed(ProtocolError),
}

/// Text frames are always control traffic.
pub fn classify_text(text: &str) -> Classified {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return Classified::Malformed(ProtocolError::InvalidJson(e.to_string())),
    };
    match message_type(&value) {
        Some(t) if is_recognized_type(t) => decode_control(value),
        Some(_) => Classified::Passthrough(value),
        None => Classified::Malformed(ProtocolError::MissingType),
    }
}

/// Binary frames are audio unless they decode as UTF-8 JSON with a
/// recognized `type`. Unrecognized JSON in a binary frame stays audio.
pub fn classify_binary(payload: Bytes) -> Classified {
    if !looks_like_json_object(&payload) {
        return Classified::Audio(payload);
    }
    let Ok(text) = std::str::from_utf8(&payload) else {
        return Classified::Audio(payload);
    };
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Classified::Audio(payload);
    };
    match message_type(&value) {
        Some(t) if is_recognized_type(t) => decode_control(value),
        _ => Classified::Audio(payload),
    }
}

fn looks_like_json_object(payload: &[u8]) -> bool {
    payload
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}

fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

fn decode_control(value: Value) -> Classified {
    let message_type = message_type(&value).unwrap_or_default().to_string();
    match serde_json::from_value::<InboundMessage>(value) {
        Ok(msg) => Classified::Control(msg),
        Err(e) => Classified::Malformed(ProtocolError::Malformed {
            message_type,
            reason: e.to_string(),
        }),
    }
}
