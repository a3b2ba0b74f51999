//! Connection Manager
//!
//! Owns the single logical connection to the upstream feed.
//!
//! Manages the connection lifecycle including:
//! - Optional authentication
//! - Heartbeat monitoring and staleness detection
//! - Automatic reconnection with exponential backoff and a bounded attempt count
//! - Replay of the active subscription set after every (re)connect
//!
//! # State Machine
//!
//! ```text
//! Disconnected ─connect()─► Connecting ─ok─► Connected
//!                               │                │ heartbeat timeout / transport close
//!                               │ fail           ▼
//!                               └──────────► Reconnecting ─ok─► Connected
//!                                                │ attempts exhausted
//!                                                ▼
//!     disconnect() from any state ─────────► Terminated
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::auth::{AUTH_TIMEOUT, AuthError, Credentials, authenticate};
use super::codec::JsonCodec;
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
use super::messages::{ClientMessage, ServerMessage, SubscriptionRequest};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{Transport, TransportError, TransportLink, UpstreamSubscriptions};
use crate::domain::market::{DepthSnapshot, MarketFrame, OhlcBar, PriceTick};
use crate::domain::subscription::SubscriptionKey;
use crate::infrastructure::config::FeedSettings;
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors returned by the connection manager.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// Invalid or incomplete configuration. Not retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transport failed to open.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A connection attempt is already running.
    #[error("connection attempt already in progress")]
    InProgress,

    /// `disconnect()` was called while the attempt was running.
    #[error("connection attempt cancelled by disconnect")]
    Cancelled,
}

// =============================================================================
// State and Events
// =============================================================================

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected.
    Disconnected,
    /// First attempt in progress.
    Connecting,
    /// Session established.
    Connected,
    /// Waiting for or running a retry.
    Reconnecting,
    /// Gave up or explicitly closed.
    Terminated,
}

impl ConnectionState {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Session established (and authenticated if required).
    Connected,
    /// Session lost.
    Disconnected {
        /// Why the session ended.
        reason: String,
    },
    /// A retry is scheduled.
    Reconnecting {
        /// Retry number, 1-indexed.
        attempt: u32,
        /// Wait before the retry.
        delay: Duration,
    },
    /// Non-fatal error.
    Error(String),
    /// Retries exhausted; the connection is terminated.
    MaxReconnectAttemptsReached {
        /// Retries made.
        attempts: u32,
    },
    /// Price tick received.
    PriceUpdate(PriceTick),
    /// Depth snapshot received.
    DepthUpdate(DepthSnapshot),
    /// OHLC bar received.
    OhlcUpdate(OhlcBar),
}

impl ConnectionEvent {
    /// Market data carried by the event, if any.
    #[must_use]
    pub fn market_frame(&self) -> Option<MarketFrame> {
        match self {
            Self::PriceUpdate(tick) => Some(MarketFrame::Price(tick.clone())),
            Self::DepthUpdate(depth) => Some(MarketFrame::Depth(depth.clone())),
            Self::OhlcUpdate(bar) => Some(MarketFrame::Ohlc(bar.clone())),
            _ => None,
        }
    }

    fn from_frame(frame: MarketFrame) -> Self {
        match frame {
            MarketFrame::Price(tick) => Self::PriceUpdate(tick),
            MarketFrame::Depth(depth) => Self::DepthUpdate(depth),
            MarketFrame::Ohlc(bar) => Self::OhlcUpdate(bar),
        }
    }
}

/// Point-in-time view of the connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    /// Connection id (UUID v4).
    pub id: String,
    /// Upstream endpoint.
    pub endpoint: String,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Whether the state is `Connected`.
    pub connected: bool,
    /// Consecutive failed retries.
    pub reconnect_attempts: u32,
    /// Retry bound (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Last inbound traffic.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Keys that are (or will be) subscribed upstream.
    pub active_subscriptions: Vec<String>,
    /// Most recent error.
    pub last_error: Option<String>,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// API credentials, when the feed requires them.
    pub credentials: Option<Credentials>,
    /// Reject `connect()` when credentials are missing.
    pub require_auth: bool,
    /// Time allowed for the auth exchange.
    pub auth_timeout: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            credentials: None,
            require_auth: false,
            auth_timeout: AUTH_TIMEOUT,
            event_capacity: 1024,
        }
    }
}

impl ConnectionConfig {
    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub fn from_feed_settings(settings: &FeedSettings) -> Self {
        Self {
            reconnect: ReconnectConfig::from_feed_settings(settings),
            heartbeat: HeartbeatConfig::from_feed_settings(settings),
            credentials: settings.credentials.clone(),
            require_auth: settings.require_auth,
            auth_timeout: AUTH_TIMEOUT,
            event_capacity: settings.event_capacity,
        }
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

#[derive(Debug)]
struct StateData {
    state: ConnectionState,
    attempts: u32,
    last_error: Option<String>,
    ever_connected: bool,
}

struct Inner {
    id: String,
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    codec: JsonCodec,
    state: RwLock<StateData>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    active: Mutex<BTreeSet<SubscriptionKey>>,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: Mutex<CancellationToken>,
    heartbeat: Arc<HeartbeatState>,
}

/// Resilient upstream connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.transport.endpoint())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager for a transport.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Configuration`] if the transport has no endpoint.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        if transport.endpoint().trim().is_empty() {
            return Err(ConnectionError::Configuration(
                "feed endpoint is required".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                transport,
                config,
                codec: JsonCodec::new(),
                state: RwLock::new(StateData {
                    state: ConnectionState::Disconnected,
                    attempts: 0,
                    last_error: None,
                    ever_connected: false,
                }),
                outbound: Mutex::new(None),
                active: Mutex::new(BTreeSet::new()),
                events,
                cancel: Mutex::new(CancellationToken::new()),
                heartbeat: Arc::new(HeartbeatState::new()),
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Establish the connection.
    ///
    /// On failure the error is recorded, an `Error` event is emitted and
    /// reconnection continues in the background.
    ///
    /// # Errors
    ///
    /// Returns the first attempt's failure, a configuration error when
    /// credentials are required but missing, [`ConnectionError::InProgress`],
    /// or [`ConnectionError::Cancelled`] if `disconnect()` won the race.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.inner.config.require_auth && self.inner.config.credentials.is_none() {
            let error = ConnectionError::Configuration(
                "feed requires authentication but no credentials are configured".to_string(),
            );
            self.record_error(&error.to_string());
            return Err(error);
        }

        let cancel = {
            let mut state = self.inner.state.write();
            match state.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    return Err(ConnectionError::InProgress);
                }
                ConnectionState::Disconnected | ConnectionState::Terminated => {}
            }
            state.state = ConnectionState::Connecting;
            state.attempts = 0;

            let mut token = self.inner.cancel.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };
        metrics::set_connection_state(ConnectionState::Connecting);

        tracing::info!(
            connection_id = %self.inner.id,
            endpoint = %self.inner.transport.endpoint(),
            "Connecting to upstream feed"
        );

        match self.open_session().await {
            Ok(link) => {
                if self.start_session(link, cancel) {
                    Ok(())
                } else {
                    Err(ConnectionError::Cancelled)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Initial connection attempt failed");
                self.record_error(&e.to_string());
                self.set_state(ConnectionState::Reconnecting);
                tokio::spawn(self.clone().reconnect_loop(cancel));
                Err(e)
            }
        }
    }

    /// Close the connection and stop every background task. Idempotent.
    pub fn disconnect(&self) {
        let was = {
            let mut state = self.inner.state.write();
            let was = state.state;
            state.state = ConnectionState::Terminated;
            was
        };
        self.inner.cancel.lock().cancel();
        self.inner.outbound.lock().take();

        if was == ConnectionState::Terminated {
            return;
        }

        metrics::set_connection_state(ConnectionState::Terminated);
        tracing::info!(connection_id = %self.inner.id, "Disconnected from upstream feed");
        if was == ConnectionState::Connected {
            self.emit(ConnectionEvent::Disconnected {
                reason: "explicit disconnect".to_string(),
            });
        }
    }

    /// Add a key to the active set, sending `subscribe` when connected.
    ///
    /// The active set stays locked while the message is sent, so a session
    /// coming up either replays the key or sees it sent here, never both.
    pub fn subscribe(&self, key: &SubscriptionKey) {
        let mut active = self.inner.active.lock();
        if !active.insert(key.clone()) {
            return;
        }
        tracing::debug!(key = %key, "Upstream subscribe");
        self.send_control(&ClientMessage::Subscribe(request_for(std::iter::once(key))));
    }

    /// Remove a key from the active set, sending `unsubscribe` when connected.
    pub fn unsubscribe(&self, key: &SubscriptionKey) {
        let mut active = self.inner.active.lock();
        if !active.remove(key) {
            return;
        }
        tracing::debug!(key = %key, "Upstream unsubscribe");
        self.send_control(&ClientMessage::Unsubscribe(request_for(std::iter::once(key))));
    }

    /// Whether a session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.read().state
    }

    /// Receiver for connection events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Point-in-time view of the connection.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let active = self
            .inner
            .active
            .lock()
            .iter()
            .map(ToString::to_string)
            .collect();
        let state = self.inner.state.read();
        let reconnect = &self.inner.config.reconnect;

        ConnectionSnapshot {
            id: self.inner.id.clone(),
            endpoint: self.inner.transport.endpoint().to_string(),
            state: state.state,
            connected: state.state == ConnectionState::Connected,
            reconnect_attempts: state.attempts,
            max_reconnect_attempts: reconnect.max_attempts,
            base_delay_ms: u64::try_from(reconnect.initial_delay.as_millis()).unwrap_or(u64::MAX),
            last_heartbeat: state
                .ever_connected
                .then(|| self.inner.heartbeat.last_heartbeat()),
            active_subscriptions: active,
            last_error: state.last_error.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------------------

    async fn open_session(&self) -> Result<TransportLink, ConnectionError> {
        let mut link = self.inner.transport.open().await?;

        if let Some(credentials) = &self.inner.config.credentials {
            authenticate(
                &mut link,
                credentials,
                &self.inner.codec,
                self.inner.config.auth_timeout,
            )
            .await?;
            tracing::debug!("Feed session authenticated");
        }

        Ok(link)
    }

    /// Install an opened link and spawn its session. Returns false, dropping
    /// the link, when `disconnect()` got there first.
    ///
    /// Lock order is active set, then state, then outbound.
    fn start_session(&self, link: TransportLink, cancel: CancellationToken) -> bool {
        let TransportLink { outbound, inbound } = link;

        {
            let active = self.inner.active.lock();
            {
                let mut state = self.inner.state.write();
                if state.state == ConnectionState::Terminated || cancel.is_cancelled() {
                    tracing::debug!("Dropping link opened after disconnect");
                    return false;
                }
                state.state = ConnectionState::Connected;
                state.attempts = 0;
                state.ever_connected = true;
                *self.inner.outbound.lock() = Some(outbound);
            }
            self.inner.heartbeat.touch();
            self.restore_subscriptions(&active);
        }
        metrics::set_connection_state(ConnectionState::Connected);

        tracing::info!(connection_id = %self.inner.id, "Connected to upstream feed");
        self.emit(ConnectionEvent::Connected);

        let session: BoxFuture<'static, ()> = self.clone().run_session(inbound, cancel).boxed();
        tokio::spawn(session);
        true
    }

    async fn run_session(
        self,
        mut inbound: mpsc::Receiver<Result<String, TransportError>>,
        cancel: CancellationToken,
    ) {
        let session_cancel = cancel.child_token();
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        let monitor = HeartbeatMonitor::new(
            self.inner.config.heartbeat.clone(),
            Arc::clone(&self.inner.heartbeat),
            heartbeat_tx,
            session_cancel.clone(),
        );
        tokio::spawn(monitor.run());

        let reason = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    session_cancel.cancel();
                    return;
                }
                event = heartbeat_rx.recv() => {
                    match event {
                        Some(HeartbeatEvent::SendPing) => self.send_control(&ClientMessage::Ping),
                        Some(HeartbeatEvent::Timeout { silent_for }) => {
                            break format!("heartbeat timeout after {}ms", silent_for.as_millis());
                        }
                        None => {}
                    }
                }
                frame = inbound.recv() => {
                    match frame {
                        Some(Ok(text)) => {
                            self.inner.heartbeat.touch();
                            self.handle_text(&text);
                        }
                        Some(Err(e)) => {
                            self.emit(ConnectionEvent::Error(e.to_string()));
                            break e.to_string();
                        }
                        None => break "transport closed".to_string(),
                    }
                }
            }
        };

        session_cancel.cancel();
        self.inner.outbound.lock().take();
        if cancel.is_cancelled() {
            return;
        }

        tracing::warn!(reason = %reason, "Upstream session lost");
        self.record_error(&reason);
        self.set_state(ConnectionState::Reconnecting);
        self.emit(ConnectionEvent::Disconnected { reason });

        self.reconnect_loop(cancel).await;
    }

    async fn reconnect_loop(self, cancel: CancellationToken) {
        let mut policy = ReconnectPolicy::new(self.inner.config.reconnect.clone());

        loop {
            let Some(delay) = policy.next_delay() else {
                let attempts = policy.attempt_count();
                tracing::error!(attempts, "Maximum reconnection attempts reached");
                self.set_state(ConnectionState::Terminated);
                cancel.cancel();
                self.emit(ConnectionEvent::MaxReconnectAttemptsReached { attempts });
                return;
            };
            let attempt = policy.attempt_count();

            {
                let mut state = self.inner.state.write();
                if state.state == ConnectionState::Terminated {
                    return;
                }
                state.state = ConnectionState::Reconnecting;
                state.attempts = attempt;
            }
            metrics::set_connection_state(ConnectionState::Reconnecting);
            metrics::record_reconnect_attempt();

            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to upstream feed"
            );
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });

            let attempt_result = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Reconnect cancelled");
                    return;
                }
                result = async {
                    tokio::time::sleep(delay).await;
                    self.open_session().await
                } => result,
            };

            match attempt_result {
                Ok(link) => {
                    self.start_session(link, cancel);
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnection attempt failed");
                    self.record_error(&e.to_string());
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Frames
    // -------------------------------------------------------------------------

    fn handle_text(&self, text: &str) {
        let messages = match self.inner.codec.decode(text) {
            Ok(messages) => messages,
            Err(e) => {
                metrics::record_malformed_frame();
                tracing::warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        for message in messages {
            match message {
                ServerMessage::Pong => {}
                ServerMessage::ConnectionStatus(status) => {
                    tracing::debug!(status = %status.status, "Connection status");
                }
                ServerMessage::SubscriptionSuccess(ack) => {
                    tracing::debug!(symbols = ?ack.symbols, event_types = ?ack.event_types, "Subscription confirmed");
                }
                ServerMessage::UnsubscriptionSuccess(ack) => {
                    tracing::debug!(symbols = ?ack.symbols, event_types = ?ack.event_types, "Unsubscription confirmed");
                }
                ServerMessage::Error(body) => {
                    tracing::warn!(code = ?body.code, message = %body.message, "Feed reported error");
                    self.record_error(&body.message);
                    self.emit(ConnectionEvent::Error(body.message));
                }
                data => {
                    if let Some(frame) = data.into_market_frame() {
                        metrics::record_frame_received(frame.kind());
                        self.emit(ConnectionEvent::from_frame(frame));
                    }
                }
            }
        }
    }

    fn restore_subscriptions(&self, keys: &BTreeSet<SubscriptionKey>) {
        if keys.is_empty() {
            return;
        }

        let mut by_event_type: BTreeMap<String, Vec<&SubscriptionKey>> = BTreeMap::new();
        for key in keys {
            by_event_type
                .entry(key.kind().event_type())
                .or_default()
                .push(key);
        }

        tracing::info!(keys = keys.len(), "Restoring upstream subscriptions");
        for group in by_event_type.values() {
            self.send_control(&ClientMessage::Subscribe(request_for(group.iter().copied())));
        }
    }

    fn send_control(&self, message: &ClientMessage) {
        let text = match self
            .inner
            .codec
            .encode(message, Utc::now().timestamp_millis())
        {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, kind = message.message_type(), "Failed to encode control message");
                return;
            }
        };

        let sent = self
            .inner
            .outbound
            .lock()
            .as_ref()
            .is_some_and(|outbound| outbound.send(text).is_ok());

        if !sent && self.is_connected() {
            let error = format!("failed to send {}", message.message_type());
            tracing::warn!(error = %error, "Control message not delivered");
            self.emit(ConnectionEvent::Error(error));
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.write().state = state;
        metrics::set_connection_state(state);
    }

    fn record_error(&self, error: &str) {
        self.inner.state.write().last_error = Some(error.to_string());
        self.emit(ConnectionEvent::Error(error.to_string()));
    }
}

impl UpstreamSubscriptions for ConnectionManager {
    fn subscribe(&self, key: &SubscriptionKey) {
        Self::subscribe(self, key);
    }

    fn unsubscribe(&self, key: &SubscriptionKey) {
        Self::unsubscribe(self, key);
    }
}

/// Build a control body for keys sharing one event type.
fn request_for<'a>(keys: impl Iterator<Item = &'a SubscriptionKey>) -> SubscriptionRequest {
    let mut symbols = Vec::new();
    let mut event_types = BTreeSet::new();
    for key in keys {
        if !symbols.iter().any(|s: &String| s == key.symbol()) {
            symbols.push(key.symbol().to_string());
        }
        event_types.insert(key.kind().event_type());
    }

    SubscriptionRequest {
        symbols,
        event_types: event_types.into_iter().collect(),
    }
}
