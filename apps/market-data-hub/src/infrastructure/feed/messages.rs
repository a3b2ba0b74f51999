//! Feed Message Types
//!
//! Wire format types for the upstream feed protocol. Every frame is a JSON
//! envelope `{type, data, timestamp}`.
//!
//! # Message Types
//!
//! ## Client → Server
//! - `subscribe` / `unsubscribe`: `{symbols: [..], eventTypes: [..]}`
//! - `ping`: keep-alive
//! - `auth`: `{apiKey, apiSecret}`
//!
//! ## Server → Client (control)
//! - `connection_status`: e.g. `{status: "authenticated"}`
//! - `subscription_success` / `unsubscription_success`
//! - `pong`
//! - `error`: `{message, code?}`
//!
//! ## Server → Client (data)
//! - `price_update`, `depth_update`, `ohlc_update`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::market::{DepthSnapshot, MarketFrame, OhlcBar, PriceTick};

// =============================================================================
// Envelope
// =============================================================================

/// Generic frame envelope.
///
/// # Wire Format (JSON)
/// ```json
/// {"type": "price_update", "data": {"symbol": "EURUSD", "bid": 1.105, "ask": 1.1052}, "timestamp": 1718000000000}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Message body.
    #[serde(default)]
    pub data: Value,

    /// Sender timestamp (epoch milliseconds for client frames).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

// =============================================================================
// Client Messages
// =============================================================================

/// Body of `subscribe` / `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// Symbols to (un)subscribe.
    pub symbols: Vec<String>,
    /// Event types, e.g. `price`, `depth`, `ohlc_1m`.
    pub event_types: Vec<String>,
}

/// Body of `auth`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// API key.
    pub api_key: String,
    /// API secret.
    pub api_secret: String,
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Frames sent to the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Start streams.
    Subscribe(SubscriptionRequest),
    /// Stop streams.
    Unsubscribe(SubscriptionRequest),
    /// Keep-alive.
    Ping,
    /// Authenticate the session.
    Auth(AuthRequest),
}

impl ClientMessage {
    /// Wire type name.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Ping => "ping",
            Self::Auth(_) => "auth",
        }
    }

    /// Wrap in an envelope stamped with `timestamp_ms`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be serialized.
    pub fn to_envelope(&self, timestamp_ms: i64) -> Result<Envelope, serde_json::Error> {
        let data = match self {
            Self::Subscribe(request) | Self::Unsubscribe(request) => serde_json::to_value(request)?,
            Self::Ping => Value::Null,
            Self::Auth(auth) => serde_json::to_value(auth)?,
        };

        Ok(Envelope {
            message_type: self.message_type().to_string(),
            data,
            timestamp: Some(Value::from(timestamp_ms)),
        })
    }
}

// =============================================================================
// Server Messages
// =============================================================================

/// Body of `connection_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Status, e.g. `connected` or `authenticated`.
    pub status: String,
    /// Optional detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConnectionStatus {
    /// Whether the status acknowledges authentication.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.status.eq_ignore_ascii_case("authenticated")
    }
}

/// Body of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error description.
    #[serde(default)]
    pub message: String,
    /// Optional numeric code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

/// Frames received from the upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Connection or authentication status.
    ConnectionStatus(ConnectionStatus),
    /// Subscribe acknowledged.
    SubscriptionSuccess(SubscriptionRequest),
    /// Unsubscribe acknowledged.
    UnsubscriptionSuccess(SubscriptionRequest),
    /// Keep-alive reply.
    Pong,
    /// Server-reported error.
    Error(ErrorBody),
    /// Price tick.
    PriceUpdate(PriceTick),
    /// Depth snapshot.
    DepthUpdate(DepthSnapshot),
    /// OHLC bar.
    OhlcUpdate(OhlcBar),
}

impl ServerMessage {
    /// Market data frame carried by this message, if any.
    #[must_use]
    pub fn into_market_frame(self) -> Option<MarketFrame> {
        match self {
            Self::PriceUpdate(tick) => Some(MarketFrame::Price(tick)),
            Self::DepthUpdate(depth) => Some(MarketFrame::Depth(depth)),
            Self::OhlcUpdate(bar) => Some(MarketFrame::Ohlc(bar)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscribe_envelope_shape() {
        let message = ClientMessage::Subscribe(SubscriptionRequest {
            symbols: vec!["EURUSD".to_string()],
            event_types: vec!["price".to_string()],
        });

        let envelope = message.to_envelope(1_700_000_000_000).unwrap();
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "subscribe",
                "data": { "symbols": ["EURUSD"], "eventTypes": ["price"] },
                "timestamp": 1_700_000_000_000_i64
            })
        );
    }

    #[test]
    fn auth_envelope_uses_camel_case() {
        let message = ClientMessage::Auth(AuthRequest {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        });

        let envelope = message.to_envelope(0).unwrap();
        assert_eq!(envelope.message_type, "auth");
        assert_eq!(envelope.data, json!({ "apiKey": "key", "apiSecret": "secret" }));
    }

    #[test]
    fn auth_debug_redacts_credentials() {
        let auth = AuthRequest {
            api_key: "key-123".to_string(),
            api_secret: "secret-456".to_string(),
        };
        let debug = format!("{auth:?}");
        assert!(!debug.contains("key-123"));
        assert!(!debug.contains("secret-456"));
    }

    #[test]
    fn ping_has_null_body() {
        let envelope = ClientMessage::Ping.to_envelope(0).unwrap();
        assert_eq!(envelope.message_type, "ping");
        assert!(envelope.data.is_null());
    }
}
