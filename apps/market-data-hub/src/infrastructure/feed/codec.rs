//! Feed Codec
//!
//! JSON encoding and decoding of feed envelopes. A text frame holds either
//! one envelope object or an array of envelopes.

use serde_json::Value;

use super::messages::{
    ClientMessage, ConnectionStatus, Envelope, ErrorBody, ServerMessage, SubscriptionRequest,
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

/// JSON codec for the feed protocol.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, is not an envelope, or an
    /// envelope has an unknown type or malformed body.
    pub fn decode(&self, text: &str) -> Result<Vec<ServerMessage>, CodecError> {
        let trimmed = text.trim();

        if trimmed.starts_with('[') {
            let envelopes: Vec<Envelope> = serde_json::from_str(trimmed)?;
            envelopes.into_iter().map(Self::decode_envelope).collect()
        } else if trimmed.starts_with('{') {
            let envelope: Envelope = serde_json::from_str(trimmed)?;
            Ok(vec![Self::decode_envelope(envelope)?])
        } else {
            let preview: String = trimmed.chars().take(50).collect();
            Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {preview}..."
            )))
        }
    }

    fn decode_envelope(envelope: Envelope) -> Result<ServerMessage, CodecError> {
        let Envelope {
            message_type, data, ..
        } = envelope;

        let message = match message_type.as_str() {
            "connection_status" => {
                ServerMessage::ConnectionStatus(serde_json::from_value::<ConnectionStatus>(data)?)
            }
            "subscription_success" => {
                ServerMessage::SubscriptionSuccess(serde_json::from_value::<SubscriptionRequest>(
                    data,
                )?)
            }
            "unsubscription_success" => ServerMessage::UnsubscriptionSuccess(
                serde_json::from_value::<SubscriptionRequest>(data)?,
            ),
            "pong" => ServerMessage::Pong,
            "error" => ServerMessage::Error(Self::decode_error(data)?),
            "price_update" => ServerMessage::PriceUpdate(serde_json::from_value(data)?),
            "depth_update" => ServerMessage::DepthUpdate(serde_json::from_value(data)?),
            "ohlc_update" => ServerMessage::OhlcUpdate(serde_json::from_value(data)?),
            other => return Err(CodecError::UnknownMessageType(other.to_string())),
        };

        Ok(message)
    }

    /// Error bodies arrive either as an object or a bare string.
    fn decode_error(data: Value) -> Result<ErrorBody, CodecError> {
        match data {
            Value::String(message) => Ok(ErrorBody {
                message,
                code: None,
            }),
            Value::Null => Ok(ErrorBody {
                message: "unspecified error".to_string(),
                code: None,
            }),
            other => Ok(serde_json::from_value(other)?),
        }
    }

    /// Encode a client message stamped with `timestamp_ms`.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, message: &ClientMessage, timestamp_ms: i64) -> Result<String, CodecError> {
        let envelope = message.to_envelope(timestamp_ms)?;
        Ok(serde_json::to_string(&envelope)?)
    }
}
