//! Heartbeat Monitor
//!
//! Detects stale upstream connections. Every inbound frame refreshes the
//! heartbeat; a periodic check either requests a `ping` or, when nothing has
//! arrived within the timeout, reports the connection as lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::FeedSettings;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between checks (and pings).
    pub interval: Duration,
    /// Silence after which the connection is considered lost.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub const fn from_feed_settings(settings: &FeedSettings) -> Self {
        Self {
            interval: settings.heartbeat_interval,
            timeout: settings.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping control message.
    SendPing,
    /// No inbound traffic within the timeout.
    Timeout {
        /// Silence observed.
        silent_for: Duration,
    },
}

/// Last-heartbeat bookkeeping shared by the session and the monitor.
#[derive(Debug)]
pub struct HeartbeatState {
    last_seen: RwLock<(Instant, DateTime<Utc>)>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_seen: RwLock::new((Instant::now(), Utc::now())),
        }
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.last_seen.write() = (Instant::now(), Utc::now());
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silent_for(&self) -> Duration {
        self.last_seen.read().0.elapsed()
    }

    /// Wall-clock time of the last inbound frame.
    #[must_use]
    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.last_seen.read().1
    }
}

/// Periodic staleness check for one session.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or a timeout is reported.
    pub async fn run(self) {
        let start = Instant::now() + self.config.interval;
        let mut interval = tokio::time::interval_at(start, self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` once the loop should stop.
    async fn check(&self) -> bool {
        let silent_for = self.state.silent_for();
        if silent_for >= self.config.timeout {
            tracing::warn!(
                silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                "Heartbeat timeout detected"
            );
            let _ = self.event_tx.send(HeartbeatEvent::Timeout { silent_for }).await;
            return false;
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("Heartbeat channel closed, stopping monitor");
            return false;
        }
        true
    }
}
