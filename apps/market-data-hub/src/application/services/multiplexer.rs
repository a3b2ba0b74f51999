//! Subscription Multiplexer
//!
//! Reference-counts local interest in `(symbol, kind)` keys over a single
//! upstream connection and fans inbound frames out to local handlers.
//!
//! # Invariants
//!
//! - The upstream is subscribed to a key exactly when it has at least one
//!   handler. Registry mutation and the upstream call happen under one lock,
//!   so concurrent add/cancel pairs cannot reorder subscribe/unsubscribe.
//! - Dispatch calls handlers in registration order from a snapshot taken
//!   under the lock. A cancelled handler is never called again, even if it
//!   was in the snapshot.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::application::ports::UpstreamSubscriptions;
use crate::domain::market::{DataKind, MarketFrame, Timeframe};
use crate::domain::subscription::{
    HandlerId, InterestRegistry, SubscriptionKey, SubscriptionStats, UpstreamChange,
};
use crate::infrastructure::feed::ConnectionEvent;
use crate::infrastructure::metrics;

/// Frame handler. Errors are logged and do not affect other handlers.
pub type FrameHandler = Arc<dyn Fn(&MarketFrame) -> anyhow::Result<()> + Send + Sync>;

struct HandlerEntry {
    active: Arc<AtomicBool>,
    handler: FrameHandler,
}

struct MuxInner {
    registry: Mutex<InterestRegistry<HandlerEntry>>,
    upstream: Arc<dyn UpstreamSubscriptions>,
    ohlc_timeframes: Vec<Timeframe>,
}

impl MuxInner {
    fn apply(&self, key: &SubscriptionKey, change: UpstreamChange) {
        match change {
            UpstreamChange::Subscribe => {
                tracing::debug!(key = %key, "First interest, subscribing upstream");
                self.upstream.subscribe(key);
            }
            UpstreamChange::Unsubscribe => {
                tracing::debug!(key = %key, "Last interest gone, unsubscribing upstream");
                self.upstream.unsubscribe(key);
            }
            UpstreamChange::None => {}
        }
    }
}

// =============================================================================
// Multiplexer
// =============================================================================

/// Maps local interest onto one upstream stream.
///
/// Cloning is cheap; clones share one registry.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMultiplexer")
            .field("stats", &self.stats())
            .field("ohlc_timeframes", &self.inner.ohlc_timeframes)
            .finish_non_exhaustive()
    }
}

impl SubscriptionMultiplexer {
    /// Create a multiplexer over an upstream.
    ///
    /// `ohlc_timeframes` is the fan-out of [`Self::add_ohlc_interest`]; an
    /// empty list falls back to the default `1m, 5m, 15m, 1h`.
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamSubscriptions>, ohlc_timeframes: Vec<Timeframe>) -> Self {
        let ohlc_timeframes = if ohlc_timeframes.is_empty() {
            Timeframe::DEFAULT_FAN_OUT.to_vec()
        } else {
            ohlc_timeframes
        };

        Self {
            inner: Arc::new(MuxInner {
                registry: Mutex::new(InterestRegistry::new()),
                upstream,
                ohlc_timeframes,
            }),
        }
    }

    /// Register a handler for one key.
    ///
    /// The first handler for a key subscribes upstream.
    pub fn add_interest<F>(&self, symbol: &str, kind: DataKind, handler: F) -> InterestHandle
    where
        F: Fn(&MarketFrame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(vec![SubscriptionKey::new(symbol, kind)], Arc::new(handler))
    }

    /// Register one handler for every configured OHLC timeframe of a symbol.
    pub fn add_ohlc_interest<F>(&self, symbol: &str, handler: F) -> InterestHandle
    where
        F: Fn(&MarketFrame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let keys = self
            .inner
            .ohlc_timeframes
            .iter()
            .map(|tf| SubscriptionKey::ohlc(symbol, *tf))
            .collect();
        self.register(keys, Arc::new(handler))
    }

    /// Register a shared handler for several keys under one handle.
    pub fn add_shared_interest(
        &self,
        keys: Vec<SubscriptionKey>,
        handler: FrameHandler,
    ) -> InterestHandle {
        self.register(keys, handler)
    }

    fn register(&self, keys: Vec<SubscriptionKey>, handler: FrameHandler) -> InterestHandle {
        let active = Arc::new(AtomicBool::new(true));
        let mut ids = Vec::with_capacity(keys.len());

        {
            let mut registry = self.inner.registry.lock();
            for key in keys {
                let entry = HandlerEntry {
                    active: Arc::clone(&active),
                    handler: Arc::clone(&handler),
                };
                let (id, change) = registry.add(key.clone(), entry);
                self.inner.apply(&key, change);
                ids.push(id);
            }
            metrics::set_active_interests(registry.stats().handler_count);
        }

        InterestHandle {
            ids,
            active,
            mux: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver a frame to every active handler of its key.
    ///
    /// Returns the number of handlers that completed without error.
    pub fn dispatch(&self, frame: &MarketFrame) -> usize {
        let key = SubscriptionKey::new(frame.symbol(), frame.kind());

        let snapshot: Vec<(HandlerId, Arc<AtomicBool>, FrameHandler)> = self
            .inner
            .registry
            .lock()
            .handlers(&key)
            .map(|(id, entry)| (*id, Arc::clone(&entry.active), Arc::clone(&entry.handler)))
            .collect();

        if snapshot.is_empty() {
            tracing::trace!(key = %key, "Frame without local interest");
            return 0;
        }

        let mut delivered = 0;
        for (id, active, handler) in snapshot {
            if !active.load(Ordering::SeqCst) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(key = %key, handler = id, error = %e, "Frame handler failed");
                }
                Err(_) => {
                    tracing::error!(key = %key, handler = id, "Frame handler panicked");
                }
            }
        }
        delivered
    }

    /// Drain connection events and dispatch market frames until cancelled
    /// or the channel closes.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) {
        tracing::debug!("Multiplexer dispatch started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Some(frame) = event.market_frame() {
                            self.dispatch(&frame);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Multiplexer lagged behind the feed, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Multiplexer dispatch stopped");
    }

    /// Reference count of a key.
    #[must_use]
    pub fn interest_count(&self, key: &SubscriptionKey) -> usize {
        self.inner.registry.lock().count(key)
    }

    /// Keys with at least one handler, sorted.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.inner.registry.lock().active_keys()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.inner.registry.lock().stats()
    }

    /// Timeframes an OHLC interest fans out to.
    #[must_use]
    pub fn ohlc_timeframes(&self) -> &[Timeframe] {
        &self.inner.ohlc_timeframes
    }
}

// =============================================================================
// Interest Handle
// =============================================================================

/// Revocable registration returned by the `add_*_interest` methods.
///
/// Dropping the handle keeps the registration and its upstream
/// subscription; keep it and call [`Self::cancel`] to release them.
#[derive(Debug)]
#[must_use = "interest stays registered until cancel() is called"]
pub struct InterestHandle {
    ids: Vec<HandlerId>,
    active: Arc<AtomicBool>,
    mux: Weak<MuxInner>,
}

impl InterestHandle {
    /// Remove the registration. The last handler of a key unsubscribes
    /// upstream. Idempotent.
    pub fn cancel(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.mux.upgrade() else {
            return;
        };

        let mut registry = inner.registry.lock();
        for id in &self.ids {
            if let Some((key, change)) = registry.remove(*id) {
                inner.apply(&key, change);
            }
        }
        metrics::set_active_interests(registry.stats().handler_count);
    }

    /// Whether the registration is still in place.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of keys covered.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.ids.len()
    }
}
