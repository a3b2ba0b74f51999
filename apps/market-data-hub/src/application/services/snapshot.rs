//! Cache Snapshot Source
//!
//! Assembles the document notification rules are evaluated against from the
//! cache key namespace:
//!
//! ```text
//! {
//!   "prices":    { "EURUSD": <tick> },
//!   "depth":     { "EURUSD": <snapshot> },
//!   "ohlc":      { "EURUSD": { "1m": <bar>, "1h": <bar> } },
//!   "positions": [ ... ],   // trading:positions
//!   "signals":   [ ... ]    // trading:signals
//! }
//! ```
//!
//! Reads go through [`DualTierCache::peek`] so that periodic evaluation
//! leaves recency, hit counters and promotion to real consumers.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::application::ports::SnapshotSource;
use crate::infrastructure::cache::DualTierCache;

/// Cache key of collaborator-owned positions.
pub const POSITIONS_KEY: &str = "trading:positions";

/// Cache key of collaborator-owned signals.
pub const SIGNALS_KEY: &str = "trading:signals";

/// Builds rule snapshots from the cache.
#[derive(Debug, Clone)]
pub struct CacheSnapshotSource {
    cache: DualTierCache,
}

impl CacheSnapshotSource {
    /// Create a source over `cache`.
    #[must_use]
    pub const fn new(cache: DualTierCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl SnapshotSource for CacheSnapshotSource {
    async fn snapshot(&self) -> Value {
        let keys = self.cache.get_keys(None).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to list cache keys for snapshot");
            Vec::new()
        });

        let mut prices = Map::new();
        let mut depth = Map::new();
        let mut ohlc: Map<String, Value> = Map::new();
        let mut positions = Value::Array(Vec::new());
        let mut signals = Value::Array(Vec::new());

        for key in keys {
            let mut parts = key.splitn(3, ':');
            let (Some(namespace), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            let timeframe = parts.next();

            // Expired entries are listed until swept; peek() filters them.
            let Some(value) = self.cache.peek(&key).await else {
                continue;
            };

            match (namespace, timeframe) {
                ("price", None) => {
                    prices.insert(name.to_string(), value);
                }
                ("depth", None) => {
                    depth.insert(name.to_string(), value);
                }
                ("ohlc", Some(tf)) => {
                    if let Value::Object(bars) = ohlc
                        .entry(name.to_string())
                        .or_insert_with(|| Value::Object(Map::new()))
                    {
                        bars.insert(tf.to_string(), value);
                    }
                }
                _ if key == POSITIONS_KEY => positions = value,
                _ if key == SIGNALS_KEY => signals = value,
                _ => {}
            }
        }

        json!({
            "prices": prices,
            "depth": depth,
            "ohlc": ohlc,
            "positions": positions,
            "signals": signals,
        })
    }
}
