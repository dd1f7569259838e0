//! Stream Codec
//!
//! JSON framing for the Alpaca stock stream. Every text frame is an array
//! of objects discriminated by their `T` field; a few control frames arrive
//! as a bare object.

use serde::Serialize;
use serde_json::Value;

use super::messages::{
    AlpacaMessage, ErrorMessage, StockBarMessage, SubscriptionMessage, SuccessMessage,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// Message types the stock stream may send that bar ingestion ignores.
const IGNORED_TYPES: &[&str] = &["q", "t", "s", "l", "n", "c", "x"];

/// JSON codec for the stock stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON parsing fails, an element has an unknown
    /// `T`, or the frame is neither an array nor an object.
    pub fn decode(&self, text: &str) -> Result<Vec<AlpacaMessage>, CodecError> {
        let trimmed = text.trim();

        if trimmed.starts_with('[') {
            let raw: Vec<Value> = serde_json::from_str(trimmed)?;
            raw.into_iter().map(Self::decode_value).collect()
        } else if trimmed.starts_with('{') {
            let value: Value = serde_json::from_str(trimmed)?;
            Ok(vec![Self::decode_value(value)?])
        } else {
            Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {}...",
                trimmed.chars().take(50).collect::<String>()
            )))
        }
    }

    fn decode_value(value: Value) -> Result<AlpacaMessage, CodecError> {
        let msg_type = value
            .get("T")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| CodecError::InvalidFormat("missing T field".to_string()))?;

        let message = match msg_type.as_str() {
            "success" => AlpacaMessage::Success(serde_json::from_value::<SuccessMessage>(value)?),
            "error" => AlpacaMessage::Error(serde_json::from_value::<ErrorMessage>(value)?),
            "subscription" => {
                AlpacaMessage::Subscription(serde_json::from_value::<SubscriptionMessage>(value)?)
            }
            "b" | "d" | "u" => AlpacaMessage::Bar(serde_json::from_value::<StockBarMessage>(value)?),
            other if IGNORED_TYPES.contains(&other) => AlpacaMessage::Ignored(msg_type),
            other => return Err(CodecError::UnknownMessageType(other.to_string())),
        };

        Ok(message)
    }

    /// Encode an outbound request.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}
