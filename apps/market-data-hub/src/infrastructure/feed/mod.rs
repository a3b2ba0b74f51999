//! Upstream Feed Adapters
//!
//! Implements the resilient connection to the upstream market data feed:
//!
//! - **Connection**: lifecycle, reconnection and subscription replay
//! - **WebSocket**: `tokio-tungstenite` transport
//! - **Mock**: scripted in-process transport (`testing` feature)

pub mod auth;
pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod messages;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod reconnect;
pub mod websocket;

pub use auth::{AUTH_TIMEOUT, AuthError, AuthHandler, AuthState, Credentials};
pub use codec::{CodecError, JsonCodec};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionSnapshot,
    ConnectionState,
};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
pub use messages::{ClientMessage, Envelope, ServerMessage, SubscriptionRequest};
#[cfg(any(test, feature = "testing"))]
pub use mock::{MockServer, MockTransport, OpenOutcome};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use websocket::WebSocketTransport;
