//! Market Data Recorder
//!
//! The frame handler that turns routed market data into shared state: each
//! frame is written to the cache under its key and announced on the bus as
//! `market:{event_type}`.

use std::sync::Arc;
use std::time::Duration;

use crate::application::services::multiplexer::{InterestHandle, SubscriptionMultiplexer};
use crate::domain::market::{DataKind, MarketFrame};
use crate::domain::subscription::SubscriptionKey;
use crate::infrastructure::bus::{EventBus, topics};
use crate::infrastructure::cache::DualTierCache;

const SOURCE: &str = "market";

/// Writes frames into the cache and publishes them on the bus.
#[derive(Debug, Clone)]
pub struct MarketRecorder {
    cache: DualTierCache,
    bus: EventBus,
    depth_ttl: Duration,
}

impl MarketRecorder {
    /// Create a recorder. Depth snapshots are cached for `depth_ttl`; other
    /// kinds use the cache default.
    #[must_use]
    pub const fn new(cache: DualTierCache, bus: EventBus, depth_ttl: Duration) -> Self {
        Self {
            cache,
            bus,
            depth_ttl,
        }
    }

    /// Record one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be represented as JSON.
    pub fn record(&self, frame: &MarketFrame) -> anyhow::Result<()> {
        let value = frame.to_json()?;
        let key = SubscriptionKey::new(frame.symbol(), frame.kind());
        let ttl = matches!(frame.kind(), DataKind::Depth).then_some(self.depth_ttl);

        self.cache.set(&key.cache_key(), value.clone(), ttl);
        self.bus
            .publish(&topics::market(frame.event_type()), value, Some(SOURCE));
        Ok(())
    }

    /// Record price, depth and every configured OHLC timeframe of a symbol.
    ///
    /// Returns the handles; cancelling them stops recording.
    pub fn track_symbol(
        self: &Arc<Self>,
        mux: &SubscriptionMultiplexer,
        symbol: &str,
    ) -> Vec<InterestHandle> {
        let recorder = Arc::clone(self);
        let price = mux.add_interest(symbol, DataKind::Price, move |frame| recorder.record(frame));

        let recorder = Arc::clone(self);
        let depth = mux.add_interest(symbol, DataKind::Depth, move |frame| recorder.record(frame));

        let recorder = Arc::clone(self);
        let ohlc = mux.add_ohlc_interest(symbol, move |frame| recorder.record(frame));

        tracing::info!(symbol = %symbol, "Recording market data");
        vec![price, depth, ohlc]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::*;
    use crate::domain::market::{DepthLevel, DepthSnapshot, PriceTick};
    use crate::application::ports::PersistentStore;
    use crate::infrastructure::cache::{CacheConfig, InMemoryStore};

    fn recorder() -> (MarketRecorder, DualTierCache, EventBus) {
        let cache = DualTierCache::new(CacheConfig::default(), Arc::new(InMemoryStore::new()));
        let bus = EventBus::new();
        (
            MarketRecorder::new(cache.clone(), bus.clone(), Duration::from_secs(60)),
            cache,
            bus,
        )
    }

    #[tokio::test]
    async fn price_frame_is_cached_and_published() {
        let (recorder, cache, bus) = recorder();
        let topics_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&topics_seen);
        let _sub = bus.subscribe("market:*", move |event| {
            sink.lock().unwrap().push(event.topic.clone());
        });

        recorder
            .record(&MarketFrame::Price(PriceTick {
                symbol: "eurusd".to_string(),
                bid: Decimal::new(1105, 3),
                ask: Decimal::new(1107, 3),
                last: None,
                volume: None,
                timestamp: Utc::now(),
            }))
            .unwrap();

        let cached = cache.get("price:EURUSD").await.unwrap();
        assert_eq!(cached["bid"], json!(1.105));
        assert_eq!(*topics_seen.lock().unwrap(), vec!["market:price_update"]);
    }

    #[tokio::test]
    async fn depth_uses_depth_ttl() {
        let store = Arc::new(InMemoryStore::new());
        let cache = DualTierCache::new(CacheConfig::default(), store.clone());
        let recorder = MarketRecorder::new(cache.clone(), EventBus::new(), Duration::from_secs(60));

        recorder
            .record(&MarketFrame::Depth(DepthSnapshot {
                symbol: "BTCUSD".to_string(),
                bids: vec![DepthLevel {
                    price: Decimal::new(65_000, 0),
                    size: Decimal::ONE,
                }],
                asks: Vec::new(),
                timestamp: Utc::now(),
            }))
            .unwrap();
        cache.flush().await;

        let persisted = store.load("depth:BTCUSD").await.unwrap().unwrap();
        assert_eq!(persisted.ttl_ms, 60_000);
    }
}
