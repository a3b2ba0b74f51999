//! Hub Context
//!
//! Builds every component once from [`HubConfig`] and owns their handles.
//! Collaborators are handed over at construction; nothing is global, so
//! tests build as many independent hubs as they need.
//!
//! # Lifecycle
//!
//! ```text
//! build() ──► start() ──► ... ──► shutdown()
//!              │
//!              ├─ load rules file (optional)
//!              ├─ spawn dispatch, status, sweeper, rule tick
//!              ├─ record configured symbols
//!              └─ connect upstream
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{PersistentStore, SnapshotSource, StoreError, Transport};
use crate::application::services::{
    CacheSnapshotSource, ConnectionStatusPublisher, InterestHandle, MarketRecorder,
    NotificationRuleEngine, RuleEngineConfig, SubscriptionMultiplexer,
};
use crate::domain::rules::RuleError;
use crate::infrastructure::actions::ActionRegistry;
use crate::infrastructure::bus::EventBus;
use crate::infrastructure::cache::{DualTierCache, FileStore, InMemoryStore};
use crate::infrastructure::config::HubConfig;
use crate::infrastructure::feed::{ConnectionConfig, ConnectionError, ConnectionManager};

/// Errors raised while building or starting the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Connection manager rejected its configuration.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Persistent tier could not be opened.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Rules file could not be loaded.
    #[error("rules error: {0}")]
    Rules(#[from] RuleError),
}

/// Owns every hub component.
pub struct HubContext {
    config: HubConfig,
    bus: EventBus,
    cache: DualTierCache,
    connection: ConnectionManager,
    multiplexer: SubscriptionMultiplexer,
    recorder: Arc<MarketRecorder>,
    engine: Arc<NotificationRuleEngine>,
    snapshots: Arc<CacheSnapshotSource>,
    status: ConnectionStatusPublisher,
    tracked: Mutex<Vec<InterestHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for HubContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubContext")
            .field("connection", &self.connection)
            .field("multiplexer", &self.multiplexer)
            .field("running_tasks", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

impl HubContext {
    /// Build every component.
    ///
    /// The persistent tier is file-backed when `cache.store_dir` is set and
    /// in-memory otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be opened or the
    /// transport has no endpoint.
    pub async fn build(config: HubConfig, transport: Arc<dyn Transport>) -> Result<Self, HubError> {
        let store: Arc<dyn PersistentStore> = match &config.cache.store_dir {
            Some(dir) => Arc::new(FileStore::open(dir).await?),
            None => Arc::new(InMemoryStore::new()),
        };

        let bus = EventBus::new();
        let cache = DualTierCache::new(config.cache.cache_config(), store);
        let connection =
            ConnectionManager::new(transport, ConnectionConfig::from_feed_settings(&config.feed))?;
        let multiplexer = SubscriptionMultiplexer::new(
            Arc::new(connection.clone()),
            config.ohlc_timeframes.clone(),
        );
        let recorder = Arc::new(MarketRecorder::new(
            cache.clone(),
            bus.clone(),
            config.cache.depth_ttl,
        ));
        let engine = Arc::new(NotificationRuleEngine::new(
            RuleEngineConfig::from_rule_settings(&config.rules),
            bus.clone(),
            ActionRegistry::with_defaults(&bus),
        ));
        let snapshots = Arc::new(CacheSnapshotSource::new(cache.clone()));
        let status = ConnectionStatusPublisher::new(bus.clone());

        Ok(Self {
            config,
            bus,
            cache,
            connection,
            multiplexer,
            recorder,
            engine,
            snapshots,
            status,
            tracked: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Start background work and connect upstream.
    ///
    /// A failed first connection attempt is logged and retried in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns an error if the rules file cannot be loaded or the
    /// connection is misconfigured.
    pub async fn start(&self) -> Result<(), HubError> {
        if let Some(path) = &self.config.rules.rules_file {
            self.engine.load_rules_file(path).await?;
        }

        self.spawn_tasks();

        for symbol in &self.config.symbols {
            self.track_symbol(symbol);
        }

        match self.connection.connect().await {
            Ok(()) => {}
            Err(e @ ConnectionError::Configuration(_)) => return Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Initial connection failed, retrying in background");
            }
        }

        tracing::info!(
            symbols = self.config.symbols.len(),
            rules = self.engine.rules().len(),
            "Hub started"
        );
        Ok(())
    }

    fn spawn_tasks(&self) {
        let mut tasks = self.tasks.lock();

        let multiplexer = self.multiplexer.clone();
        let events = self.connection.subscribe_events();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            multiplexer.run(events, cancel).await;
        }));

        let status = self.status.clone();
        let events = self.connection.subscribe_events();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            status.run(events, cancel).await;
        }));

        tasks.push(self.cache.spawn_sweeper(self.cancel.clone()));

        let engine = Arc::clone(&self.engine);
        let source: Arc<dyn SnapshotSource> = self.snapshots.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            engine.run(source, cancel).await;
        }));
    }

    /// Record price, depth and OHLC of a symbol into the cache until
    /// shutdown.
    pub fn track_symbol(&self, symbol: &str) {
        let handles = self.recorder.track_symbol(&self.multiplexer, symbol);
        self.tracked.lock().extend(handles);
    }

    /// Stop background work, drop upstream interest and flush the cache.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.connection.disconnect();

        let tracked: Vec<_> = self.tracked.lock().drain(..).collect();
        for handle in tracked {
            handle.cancel();
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.cache.flush().await;
        tracing::info!("Hub stopped");
    }

    /// Loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Event bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Dual-tier cache.
    #[must_use]
    pub const fn cache(&self) -> &DualTierCache {
        &self.cache
    }

    /// Upstream connection.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Subscription multiplexer.
    #[must_use]
    pub const fn multiplexer(&self) -> &SubscriptionMultiplexer {
        &self.multiplexer
    }

    /// Recorder that caches and publishes routed frames.
    #[must_use]
    pub const fn recorder(&self) -> &Arc<MarketRecorder> {
        &self.recorder
    }

    /// Notification rule engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<NotificationRuleEngine> {
        &self.engine
    }

    /// Snapshot source the rule engine reads.
    #[must_use]
    pub const fn snapshot_source(&self) -> &Arc<CacheSnapshotSource> {
        &self.snapshots
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::market::{DataKind, Timeframe};
    use crate::domain::subscription::SubscriptionKey;
    use crate::infrastructure::feed::{ConnectionState, MockTransport};

    fn config() -> HubConfig {
        let mut config = HubConfig::new("mock://feed");
        config.ohlc_timeframes = vec![Timeframe::M1];
        config
    }

    #[tokio::test]
    async fn build_wires_components() {
        let hub = HubContext::build(config(), Arc::new(MockTransport::new("mock://feed")))
            .await
            .unwrap();

        assert_eq!(hub.connection().state(), ConnectionState::Disconnected);
        assert_eq!(hub.multiplexer().ohlc_timeframes(), &[Timeframe::M1]);
        assert!(hub.engine().rules().is_empty());
    }

    #[tokio::test]
    async fn build_rejects_empty_endpoint() {
        let result = HubContext::build(config(), Arc::new(MockTransport::new(""))).await;
        assert!(matches!(result, Err(HubError::Connection(_))));
    }

    #[tokio::test]
    async fn build_opens_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.cache.store_dir = Some(dir.path().join("cache"));

        let hub = HubContext::build(config, Arc::new(MockTransport::new("mock://feed")))
            .await
            .unwrap();
        hub.cache().set("price:EURUSD", serde_json::json!({ "bid": 1.1 }), None);
        hub.cache().flush().await;

        assert!(dir.path().join("cache").is_dir());
        assert_eq!(hub.cache().stats().await.persistent_entries, 1);
    }

    #[tokio::test]
    async fn start_tracks_symbols_and_shutdown_releases_them() {
        let transport = Arc::new(MockTransport::new("mock://feed"));
        let mut config = config();
        config.symbols = vec!["EURUSD".to_string()];

        let hub = HubContext::build(config, transport.clone()).await.unwrap();
        hub.start().await.unwrap();

        assert!(hub.connection().is_connected());
        let price = SubscriptionKey::new("EURUSD", DataKind::Price);
        assert_eq!(hub.multiplexer().interest_count(&price), 1);
        // price, depth and one OHLC timeframe
        assert_eq!(hub.multiplexer().stats().key_count, 3);

        tokio::time::timeout(Duration::from_secs(5), hub.shutdown())
            .await
            .unwrap();
        assert_eq!(hub.multiplexer().stats().key_count, 0);
        assert_eq!(hub.connection().state(), ConnectionState::Terminated);
    }

    #[tokio::test]
    async fn start_fails_on_missing_rules_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.rules.rules_file = Some(dir.path().join("missing.json"));

        let hub = HubContext::build(config, Arc::new(MockTransport::new("mock://feed")))
            .await
            .unwrap();
        assert!(matches!(hub.start().await, Err(HubError::Rules(_))));
    }
}
