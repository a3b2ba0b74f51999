//! Feed Authentication
//!
//! Handles authentication with the upstream feed. When credentials are
//! configured the session must authenticate before it is considered
//! connected.
//!
//! # Authentication Flow
//!
//! 1. Transport opens
//! 2. Send `{"type":"auth","data":{"apiKey":"...","apiSecret":"..."}}`
//! 3. Receive `{"type":"connection_status","data":{"status":"authenticated"}}`
//!    or an `error` frame
//!
//! The whole exchange must finish within [`AUTH_TIMEOUT`].

use std::time::Duration;

use thiserror::Error;

use super::codec::JsonCodec;
use super::messages::{AuthRequest, ClientMessage, ErrorBody, ServerMessage};
use crate::application::ports::{TransportError, TransportLink};

// =============================================================================
// Constants
// =============================================================================

/// Maximum time allowed for the authentication exchange.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Credentials are missing or empty.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// Server rejected the credentials.
    #[error("authentication rejected: {message}")]
    Rejected {
        /// Server error message.
        message: String,
        /// Server error code.
        code: Option<i64>,
    },

    /// No acknowledgement within the timeout.
    #[error("authentication timeout after {0:?}")]
    Timeout(Duration),

    /// Link closed or failed during the exchange.
    #[error("transport failed during authentication: {0}")]
    Transport(#[from] TransportError),

    /// Auth request could not be encoded.
    #[error("failed to encode auth request: {0}")]
    Encode(String),
}

impl From<&ErrorBody> for AuthError {
    fn from(err: &ErrorBody) -> Self {
        Self::Rejected {
            message: err.message.clone(),
            code: err.code,
        }
    }
}

// =============================================================================
// Authentication State
// =============================================================================

/// Current state of authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Exchange not started.
    #[default]
    Idle,
    /// Request sent, awaiting acknowledgement.
    Authenticating,
    /// Acknowledged.
    Authenticated,
    /// Rejected.
    Failed,
}

impl AuthState {
    /// Check if currently authenticated.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Feed API credentials.
///
/// The `Debug` implementation redacts the secret for safe logging.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    key: String,
    secret: String,
}

impl Credentials {
    /// Create new credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if either key or secret is empty.
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Result<Self, AuthError> {
        let key = key.into();
        let secret = secret.into();

        if key.trim().is_empty() {
            return Err(AuthError::MissingCredentials(
                "API key cannot be empty".to_string(),
            ));
        }
        if secret.trim().is_empty() {
            return Err(AuthError::MissingCredentials(
                "API secret cannot be empty".to_string(),
            ));
        }

        Ok(Self { key, secret })
    }

    /// Get the API key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Build the `auth` control message.
    #[must_use]
    pub fn to_auth_message(&self) -> ClientMessage {
        ClientMessage::Auth(AuthRequest {
            api_key: self.key.clone(),
            api_secret: self.secret.clone(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Authentication Handler
// =============================================================================

/// Tracks the authentication exchange for one session.
#[derive(Debug)]
pub struct AuthHandler {
    credentials: Credentials,
    state: AuthState,
}

impl AuthHandler {
    /// Create a new authentication handler.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: AuthState::Idle,
        }
    }

    /// Get the current authentication state.
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Start the exchange and return the request to send.
    #[must_use]
    pub fn begin(&mut self) -> ClientMessage {
        self.state = AuthState::Authenticating;
        self.credentials.to_auth_message()
    }

    /// Process an inbound message during the exchange.
    ///
    /// Returns `Ok(true)` once authenticated, `Ok(false)` if the message
    /// does not conclude the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Rejected`] on an `error` frame.
    pub fn on_message(&mut self, message: &ServerMessage) -> Result<bool, AuthError> {
        match message {
            ServerMessage::ConnectionStatus(status) if status.is_authenticated() => {
                self.state = AuthState::Authenticated;
                Ok(true)
            }
            ServerMessage::Error(body) => {
                self.state = AuthState::Failed;
                Err(AuthError::from(body))
            }
            _ => Ok(false),
        }
    }
}

/// Run the authentication exchange over a freshly opened link.
///
/// Frames other than the acknowledgement are skipped.
///
/// # Errors
///
/// Returns an error on rejection, timeout or link failure.
pub async fn authenticate(
    link: &mut TransportLink,
    credentials: &Credentials,
    codec: &JsonCodec,
    timeout: Duration,
) -> Result<(), AuthError> {
    let mut handler = AuthHandler::new(credentials.clone());
    let request = codec
        .encode(&handler.begin(), chrono::Utc::now().timestamp_millis())
        .map_err(|e| AuthError::Encode(e.to_string()))?;

    link.outbound
        .send(request)
        .map_err(|_| TransportError::Closed)?;

    tokio::time::timeout(timeout, await_ack(link, &mut handler, codec))
        .await
        .map_err(|_| AuthError::Timeout(timeout))?
}

async fn await_ack(
    link: &mut TransportLink,
    handler: &mut AuthHandler,
    codec: &JsonCodec,
) -> Result<(), AuthError> {
    while let Some(frame) = link.inbound.recv().await {
        let text = frame?;

        let messages = match codec.decode(&text) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring undecodable frame during auth");
                continue;
            }
        };

        for message in &messages {
            if handler.on_message(message)? {
                return Ok(());
            }
        }
    }

    Err(AuthError::Transport(TransportError::Closed))
}
