//! Dual-Tier Cache
//!
//! A bounded memory tier in front of a [`PersistentStore`]. Writes land in
//! memory synchronously and are mirrored to the store by a write-behind task;
//! reads check memory first and promote persistent hits back into memory.
//!
//! # Ordering
//!
//! Every persistent operation, reads included, goes through one queue. A
//! `delete` or `clear` is applied after every `set` issued before it, and a
//! persistent read observes every write queued before it. `delete`, `clear`,
//! `sweep_expired` and [`DualTierCache::flush`] wait for the queue to reach
//! their operation before returning.
//!
//! # Expiry
//!
//! An entry is valid while `now - created_at < ttl`. A TTL of zero is stored
//! but never readable. Expired entries are removed lazily on read and in bulk
//! by the periodic sweeper.

mod memory;
mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use memory::{CacheEntry, Lookup, MemoryTier, estimate_size};
pub use store::{FileStore, InMemoryStore, decode_key, encode_key};

use crate::application::ports::{PersistedEntry, PersistentStore, StoreError};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Cache tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Memory tier byte budget.
    pub max_memory_bytes: usize,
    /// TTL applied when a write does not specify one.
    pub default_ttl: Duration,
    /// Interval of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 50 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Errors and Stats
// =============================================================================

/// Cache error.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Value could not be converted to or from JSON.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistent tier failed.
    #[error("persistent tier error: {0}")]
    Store(#[from] StoreError),
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Estimated bytes held in memory.
    pub memory_bytes: usize,
    /// Memory byte budget.
    pub memory_budget_bytes: usize,
    /// Entries held in memory.
    pub memory_entries: usize,
    /// Bytes held by the persistent tier.
    pub persistent_bytes: u64,
    /// Entries held by the persistent tier.
    pub persistent_entries: usize,
    /// Total `set` calls.
    pub total_writes: u64,
    /// Entries evicted from memory, including expired ones.
    pub evictions: u64,
    /// Reads that returned a value.
    pub hits: u64,
    /// Reads that returned nothing.
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of reads that hit, or zero without reads.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed from memory.
    pub memory_removed: usize,
    /// Entries removed from the persistent tier.
    pub persistent_removed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    writes: AtomicU64,
    evictions: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

// =============================================================================
// Write-Behind Queue
// =============================================================================

type LoadResult = Result<Option<PersistedEntry>, StoreError>;

enum PersistOp {
    Save {
        key: String,
        entry: PersistedEntry,
    },
    Load {
        key: String,
        ack: oneshot::Sender<LoadResult>,
    },
    Remove {
        key: String,
        ack: oneshot::Sender<bool>,
    },
    Clear {
        ack: oneshot::Sender<()>,
    },
    Sweep {
        now_ms: u64,
        ack: oneshot::Sender<usize>,
    },
    Flush {
        ack: oneshot::Sender<()>,
    },
}

async fn run_writer(store: Arc<dyn PersistentStore>, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            PersistOp::Save { key, entry } => {
                if let Err(e) = store.save(&key, &entry).await {
                    tracing::warn!(key = %key, error = %e, "Failed to persist cache entry");
                    metrics::record_persist_failure();
                }
            }
            PersistOp::Load { key, ack } => {
                let _ = ack.send(store.load(&key).await);
            }
            PersistOp::Remove { key, ack } => {
                let removed = store.remove(&key).await.unwrap_or_else(|e| {
                    tracing::warn!(key = %key, error = %e, "Failed to remove persisted entry");
                    false
                });
                let _ = ack.send(removed);
            }
            PersistOp::Clear { ack } => {
                if let Err(e) = store.clear().await {
                    tracing::warn!(error = %e, "Failed to clear persistent tier");
                }
                let _ = ack.send(());
            }
            PersistOp::Sweep { now_ms, ack } => {
                let _ = ack.send(sweep_store(store.as_ref(), now_ms).await);
            }
            PersistOp::Flush { ack } => {
                let _ = ack.send(());
            }
        }
    }
    tracing::debug!("Cache writer stopped");
}

async fn sweep_store(store: &dyn PersistentStore, now_ms: u64) -> usize {
    let keys = match store.keys().await {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list persisted entries");
            return 0;
        }
    };

    let mut removed = 0;
    for key in keys {
        let expired = match store.load(&key).await {
            Ok(Some(entry)) => !entry.is_valid(now_ms),
            Ok(None) => false,
            // Unreadable documents are dropped with the expired ones.
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Dropping unreadable persisted entry");
                true
            }
        };
        if expired && store.remove(&key).await.unwrap_or(false) {
            removed += 1;
        }
    }
    removed
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Shared State
// =============================================================================

/// Persistent reads of one key that are waiting on the writer queue.
#[derive(Debug, Default)]
struct PendingLoad {
    readers: usize,
    generation: u64,
}

/// Memory tier plus the bookkeeping that decides whether a persistent read
/// may still be promoted when it completes.
///
/// Every write to a key with a pending load bumps its generation; a load
/// only promotes if the generation it started with is still current.
#[derive(Debug)]
struct CacheState {
    memory: MemoryTier,
    loads: HashMap<String, PendingLoad>,
}

impl CacheState {
    fn begin_load(&mut self, key: &str) -> u64 {
        let load = self.loads.entry(key.to_string()).or_default();
        load.readers += 1;
        load.generation
    }

    /// Release a load. Returns whether no write touched the key meanwhile.
    fn end_load(&mut self, key: &str, generation: u64) -> bool {
        let Some(load) = self.loads.get_mut(key) else {
            return false;
        };
        let current = load.generation == generation;
        load.readers -= 1;
        if load.readers == 0 {
            self.loads.remove(key);
        }
        current
    }

    fn invalidate(&mut self, key: &str) {
        if let Some(load) = self.loads.get_mut(key) {
            load.generation += 1;
        }
    }

    fn invalidate_all(&mut self) {
        for load in self.loads.values_mut() {
            load.generation += 1;
        }
    }
}

/// A pending load that releases itself if the read is dropped mid-await.
struct LoadTicket<'a> {
    state: &'a Mutex<CacheState>,
    key: &'a str,
    generation: u64,
    settled: bool,
}

impl<'a> LoadTicket<'a> {
    /// Lock the state and release the load. The flag is true when the loaded
    /// entry may be promoted.
    fn settle(mut self) -> (MutexGuard<'a, CacheState>, bool) {
        self.settled = true;
        let mut state = self.state.lock();
        let current = state.end_load(self.key, self.generation);
        (state, current)
    }
}

impl Drop for LoadTicket<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.state.lock().end_load(self.key, self.generation);
        }
    }
}

// =============================================================================
// Dual-Tier Cache
// =============================================================================

struct CacheInner {
    state: Mutex<CacheState>,
    writer: mpsc::UnboundedSender<PersistOp>,
    store: Arc<dyn PersistentStore>,
    counters: Counters,
    config: CacheConfig,
}

/// Memory LRU in front of a persistent store.
///
/// Cloning is cheap; clones share the same tiers.
#[derive(Clone)]
pub struct DualTierCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for DualTierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DualTierCache")
            .field("memory_entries", &state.memory.len())
            .field("memory_bytes", &state.memory.bytes())
            .field("pending_loads", &state.loads.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl DualTierCache {
    /// Create a cache over `store` and start its write-behind task.
    ///
    /// Must be called inside a Tokio runtime. The writer stops once every
    /// clone of the cache is dropped.
    #[must_use]
    pub fn new(config: CacheConfig, store: Arc<dyn PersistentStore>) -> Self {
        let (writer, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&store), rx));

        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    memory: MemoryTier::new(config.max_memory_bytes),
                    loads: HashMap::new(),
                }),
                writer,
                store,
                counters: Counters::default(),
                config,
            }),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.inner.config
    }

    /// Store a value with an optional TTL (default TTL otherwise).
    ///
    /// Memory is updated before this returns; persistence happens in the
    /// background and failures are logged. A value evicted from memory
    /// before its write lands is still readable, since reads of the
    /// persistent tier queue behind pending writes.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl_ms = ttl_ms(ttl.unwrap_or(self.inner.config.default_ttl));
        let created_at_ms = now_ms();

        let evicted = {
            let mut state = self.inner.state.lock();
            state.invalidate(key);
            self.enqueue(PersistOp::Save {
                key: key.to_string(),
                entry: PersistedEntry {
                    value: value.clone(),
                    created_at_ms,
                    ttl_ms,
                    hits: 0,
                },
            });
            state.memory.insert(key, value, created_at_ms, ttl_ms, 0)
        };
        self.count_evictions(evicted.len());
        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Serialize and store a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.set(key, serde_json::to_value(value)?, ttl);
        Ok(())
    }

    /// Read a value, falling back to the persistent tier on a memory miss.
    ///
    /// A valid persistent entry is promoted into memory with its original
    /// creation time and TTL, unless the key was written or deleted while
    /// the read was in flight. Persistent read failures count as misses.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = now_ms();

        let (done, generation) = {
            let mut state = self.inner.state.lock();
            let lookup = state.memory.get(key, now);
            match lookup {
                Lookup::Hit(value) => {
                    drop(state);
                    self.record_hit();
                    return Some(value);
                }
                Lookup::Expired => self.count_evictions(1),
                Lookup::Miss => {}
            }
            (self.queue_load(key), state.begin_load(key))
        };

        let ticket = LoadTicket {
            state: &self.inner.state,
            key,
            generation,
            settled: false,
        };
        let loaded = done.await.unwrap_or(Ok(None));
        let (mut state, current) = ticket.settle();

        match loaded {
            Ok(Some(entry)) if entry.is_valid(now) => {
                let evicted = if current {
                    state.memory.insert(
                        key,
                        entry.value.clone(),
                        entry.created_at_ms,
                        entry.ttl_ms,
                        entry.hits + 1,
                    )
                } else {
                    Vec::new()
                };
                drop(state);
                self.count_evictions(evicted.len());
                self.record_hit();
                Some(entry.value)
            }
            Ok(Some(_)) => {
                if current {
                    let (ack, _) = oneshot::channel();
                    self.enqueue(PersistOp::Remove {
                        key: key.to_string(),
                        ack,
                    });
                }
                drop(state);
                self.record_miss();
                None
            }
            Ok(None) => {
                drop(state);
                self.record_miss();
                None
            }
            Err(e) => {
                drop(state);
                tracing::warn!(key = %key, error = %e, "Persistent tier read failed");
                self.record_miss();
                None
            }
        }
    }

    /// Read a value without affecting the cache.
    ///
    /// Recency, hit and miss counters and promotion are left untouched, so
    /// background readers do not disturb what consumers see. Expired entries
    /// read as `None` and are left for the sweeper.
    pub async fn peek(&self, key: &str) -> Option<Value> {
        let now = now_ms();

        let done = {
            let state = self.inner.state.lock();
            if let Some(entry) = state.memory.peek(key) {
                return entry.is_valid(now).then(|| entry.value.clone());
            }
            self.queue_load(key)
        };

        match done.await {
            Ok(Ok(Some(entry))) if entry.is_valid(now) => Some(entry.value),
            Ok(Err(e)) => {
                tracing::debug!(key = %key, error = %e, "Persistent tier peek failed");
                None
            }
            _ => None,
        }
    }

    /// Read and deserialize a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value does not deserialize into `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Remove a key from both tiers. Returns whether either tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let (in_memory, done) = {
            let mut state = self.inner.state.lock();
            state.invalidate(key);
            let (ack, done) = oneshot::channel();
            self.enqueue(PersistOp::Remove {
                key: key.to_string(),
                ack,
            });
            (state.memory.remove(key), done)
        };
        let persisted = done.await.unwrap_or(false);

        in_memory || persisted
    }

    /// Remove every entry from both tiers.
    pub async fn clear(&self) {
        let done = {
            let mut state = self.inner.state.lock();
            state.invalidate_all();
            state.memory.clear();
            let (ack, done) = oneshot::channel();
            self.enqueue(PersistOp::Clear { ack });
            done
        };
        let _ = done.await;
    }

    /// Keys in either tier containing `pattern` (all keys when `None`),
    /// sorted and deduplicated. Expired entries are included until swept.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistent tier cannot list its keys.
    pub async fn get_keys(&self, pattern: Option<&str>) -> Result<Vec<String>, CacheError> {
        self.flush().await;

        let mut keys: Vec<String> = self
            .inner
            .state
            .lock()
            .memory
            .keys()
            .map(str::to_string)
            .collect();
        keys.extend(self.inner.store.keys().await?);

        if let Some(pattern) = pattern {
            keys.retain(|key| key.contains(pattern));
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Current statistics. Persistent footprint is zero if the store fails.
    pub async fn stats(&self) -> CacheStats {
        let (memory_bytes, memory_entries, memory_budget_bytes) = {
            let state = self.inner.state.lock();
            (state.memory.bytes(), state.memory.len(), state.memory.budget())
        };

        let footprint = self.inner.store.footprint().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read persistent tier footprint");
            crate::application::ports::StoreFootprint::default()
        });

        let counters = &self.inner.counters;
        CacheStats {
            memory_bytes,
            memory_budget_bytes,
            memory_entries,
            persistent_bytes: footprint.bytes,
            persistent_entries: footprint.entries,
            total_writes: counters.writes.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
        }
    }

    /// Remove expired entries from both tiers.
    pub async fn sweep_expired(&self) -> SweepReport {
        let now = now_ms();

        let memory_removed = self.inner.state.lock().memory.sweep(now);
        self.count_evictions(memory_removed);

        let (ack, done) = oneshot::channel();
        self.enqueue(PersistOp::Sweep { now_ms: now, ack });
        let persistent_removed = done.await.unwrap_or(0);

        let report = SweepReport {
            memory_removed,
            persistent_removed,
        };
        if memory_removed + persistent_removed > 0 {
            tracing::debug!(
                memory_removed,
                persistent_removed,
                "Swept expired cache entries"
            );
        }
        report
    }

    /// Wait until every queued persistent write has been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.enqueue(PersistOp::Flush { ack });
        let _ = done.await;
    }

    /// Start the periodic expiry sweep.
    #[must_use]
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep_expired().await;
                    }
                }
            }
            tracing::debug!("Cache sweeper stopped");
        })
    }

    fn queue_load(&self, key: &str) -> oneshot::Receiver<LoadResult> {
        let (ack, done) = oneshot::channel();
        self.enqueue(PersistOp::Load {
            key: key.to_string(),
            ack,
        });
        done
    }

    fn enqueue(&self, op: PersistOp) {
        if self.inner.writer.send(op).is_err() {
            tracing::warn!("Cache writer is gone, persistent tier not updated");
        }
    }

    fn record_hit(&self) {
        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_hit();
    }

    fn record_miss(&self) {
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_miss();
    }

    fn count_evictions(&self, count: usize) {
        if count == 0 {
            return;
        }
        let count = count as u64;
        self.inner.counters.evictions.fetch_add(count, Ordering::Relaxed);
        metrics::record_cache_evictions(count);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::application::ports::{MockPersistentStore, StoreFootprint};

    fn cache_with(store: Arc<dyn PersistentStore>) -> DualTierCache {
        DualTierCache::new(CacheConfig::default(), store)
    }

    fn cache() -> (DualTierCache, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (cache_with(store.clone()), store)
    }

    #[tokio::test]
    async fn set_then_get_hits_memory() {
        let (cache, _) = cache();
        cache.set("price:EURUSD", json!({ "bid": 1.1 }), None);

        assert_eq!(cache.get("price:EURUSD").await, Some(json!({ "bid": 1.1 })));
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.total_writes, 1);
    }

    #[tokio::test]
    async fn writes_are_mirrored_to_store() {
        let (cache, store) = cache();
        cache.set("depth:EURUSD", json!([1]), Some(Duration::from_secs(60)));
        cache.flush().await;

        let persisted = store.load("depth:EURUSD").await.unwrap().unwrap();
        assert_eq!(persisted.value, json!([1]));
        assert_eq!(persisted.ttl_ms, 60_000);
    }

    #[tokio::test]
    async fn persistent_hit_is_promoted() {
        let store = Arc::new(InMemoryStore::new());
        store
            .save(
                "price:GBPUSD",
                &PersistedEntry {
                    value: json!({ "bid": 1.3 }),
                    created_at_ms: now_ms(),
                    ttl_ms: 60_000,
                    hits: 0,
                },
            )
            .await
            .unwrap();
        let cache = cache_with(store);

        assert_eq!(cache.get("price:GBPUSD").await, Some(json!({ "bid": 1.3 })));
        let stats = cache.stats().await;
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn expired_persistent_entry_is_a_miss_and_removed() {
        let store = Arc::new(InMemoryStore::new());
        store
            .save(
                "old",
                &PersistedEntry {
                    value: json!(1),
                    created_at_ms: now_ms() - 10_000,
                    ttl_ms: 1_000,
                    hits: 0,
                },
            )
            .await
            .unwrap();
        let cache = cache_with(store.clone());

        assert_eq!(cache.get("old").await, None);
        cache.flush().await;
        assert!(store.is_empty());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn zero_ttl_is_never_readable() {
        let (cache, _) = cache();
        cache.set("k", json!(1), Some(Duration::ZERO));
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn short_ttl_expires() {
        let (cache, _) = cache();
        cache.set("k", json!(1), Some(Duration::from_millis(30)));
        assert_eq!(cache.get("k").await, Some(json!(1)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.stats().await.evictions >= 1);
    }

    #[tokio::test]
    async fn delete_removes_from_both_tiers() {
        let (cache, store) = cache();
        cache.set("k", json!(1), None);

        assert!(cache.delete("k").await);
        assert!(store.is_empty());
        assert_eq!(cache.get("k").await, None);
        assert!(!cache.delete("k").await);
    }

    #[tokio::test]
    async fn clear_empties_both_tiers() {
        let (cache, store) = cache();
        cache.set("a", json!(1), None);
        cache.set("b", json!(2), None);

        cache.clear().await;

        assert!(store.is_empty());
        assert_eq!(cache.stats().await.memory_entries, 0);
    }

    #[tokio::test]
    async fn keys_are_merged_filtered_and_sorted() {
        let store = Arc::new(InMemoryStore::new());
        store
            .save(
                "price:USDJPY",
                &PersistedEntry {
                    value: json!(1),
                    created_at_ms: now_ms(),
                    ttl_ms: 60_000,
                    hits: 0,
                },
            )
            .await
            .unwrap();
        let cache = cache_with(store);
        cache.set("price:EURUSD", json!(1), None);
        cache.set("depth:EURUSD", json!(1), None);

        let keys = cache.get_keys(Some("price:")).await.unwrap();
        assert_eq!(keys, vec!["price:EURUSD", "price:USDJPY"]);

        let all = cache.get_keys(None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn lru_eviction_under_budget() {
        let size = estimate_size("k0", &json!("xxxxxxxxxx"));
        let cache = DualTierCache::new(
            CacheConfig {
                max_memory_bytes: size * 2,
                ..CacheConfig::default()
            },
            Arc::new(InMemoryStore::new()),
        );

        cache.set("k0", json!("xxxxxxxxxx"), None);
        cache.set("k1", json!("xxxxxxxxxx"), None);
        cache.set("k2", json!("xxxxxxxxxx"), None);

        let stats = cache.stats().await;
        assert_eq!(stats.memory_entries, 2);
        assert_eq!(stats.evictions, 1);
        assert!(stats.memory_bytes <= stats.memory_budget_bytes);

        // Evicted from memory but still served from the persistent tier.
        assert_eq!(cache.get("k0").await, Some(json!("xxxxxxxxxx")));
    }

    fn small_cache(entries: usize) -> DualTierCache {
        let size = estimate_size("price:AAA", &json!("xxxxxxxxxx"));
        DualTierCache::new(
            CacheConfig {
                max_memory_bytes: size * entries,
                ..CacheConfig::default()
            },
            Arc::new(InMemoryStore::new()),
        )
    }

    fn in_memory(cache: &DualTierCache, key: &str) -> bool {
        cache.inner.state.lock().memory.peek(key).is_some()
    }

    #[tokio::test]
    async fn entry_evicted_before_write_lands_is_readable() {
        let cache = small_cache(1);

        cache.set("price:AAA", json!("xxxxxxxxxx"), None);
        cache.set("price:BBB", json!("xxxxxxxxxx"), None);
        cache.set("price:CCC", json!("xxxxxxxxxx"), None);
        assert!(!in_memory(&cache, "price:AAA"));

        assert_eq!(cache.get("price:AAA").await, Some(json!("xxxxxxxxxx")));
        assert_eq!(cache.get("price:BBB").await, Some(json!("xxxxxxxxxx")));
        assert_eq!(cache.stats().await.misses, 0);
    }

    #[tokio::test]
    async fn get_protects_from_eviction_but_peek_does_not() {
        let cache = small_cache(2);
        cache.set("price:AAA", json!("xxxxxxxxxx"), None);
        cache.set("price:BBB", json!("xxxxxxxxxx"), None);
        assert!(cache.get("price:AAA").await.is_some());
        cache.set("price:CCC", json!("xxxxxxxxxx"), None);
        assert!(in_memory(&cache, "price:AAA"));
        assert!(!in_memory(&cache, "price:BBB"));

        let cache = small_cache(2);
        cache.set("price:AAA", json!("xxxxxxxxxx"), None);
        cache.set("price:BBB", json!("xxxxxxxxxx"), None);
        assert!(cache.peek("price:AAA").await.is_some());
        cache.set("price:CCC", json!("xxxxxxxxxx"), None);
        assert!(!in_memory(&cache, "price:AAA"));
        assert!(in_memory(&cache, "price:BBB"));
    }

    #[tokio::test]
    async fn peek_leaves_counters_and_tiers_alone() {
        let cache = small_cache(2);
        cache.set("price:AAA", json!("xxxxxxxxxx"), None);
        cache.set("price:BBB", json!("xxxxxxxxxx"), None);
        cache.set("price:CCC", json!("xxxxxxxxxx"), None);
        let before = cache.stats().await;

        for _ in 0..10 {
            for key in ["price:AAA", "price:BBB", "price:CCC", "price:DDD"] {
                let expected = (key != "price:DDD").then(|| json!("xxxxxxxxxx"));
                assert_eq!(cache.peek(key).await, expected);
            }
        }

        let after = cache.stats().await;
        assert_eq!(after.evictions, before.evictions);
        assert_eq!(after.hits, before.hits);
        assert_eq!(after.misses, before.misses);
        assert!(!in_memory(&cache, "price:AAA"));
    }

    #[tokio::test]
    async fn peek_hides_expired_entries() {
        let (cache, _) = cache();
        cache.set("k", json!(1), Some(Duration::ZERO));
        assert_eq!(cache.peek("k").await, None);
    }

    /// Store whose reads wait for a permit, so a test can interleave writes
    /// with a read in flight.
    struct GatedStore {
        inner: InMemoryStore,
        entered: Notify,
        release: Semaphore,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(),
                entered: Notify::new(),
                release: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl PersistentStore for GatedStore {
        async fn load(&self, key: &str) -> Result<Option<PersistedEntry>, StoreError> {
            self.entered.notify_one();
            let _permit = self.release.acquire().await;
            self.inner.load(key).await
        }

        async fn save(&self, key: &str, entry: &PersistedEntry) -> Result<(), StoreError> {
            self.inner.save(key, entry).await
        }

        async fn remove(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.remove(key).await
        }

        async fn clear(&self) -> Result<(), StoreError> {
            self.inner.clear().await
        }

        async fn keys(&self) -> Result<Vec<String>, StoreError> {
            self.inner.keys().await
        }

        async fn footprint(&self) -> Result<StoreFootprint, StoreError> {
            self.inner.footprint().await
        }
    }

    #[tokio::test]
    async fn delete_during_persistent_read_is_not_undone() {
        let store = Arc::new(GatedStore::new());
        store
            .inner
            .save(
                "price:EURUSD",
                &PersistedEntry {
                    value: json!({ "bid": 1.1 }),
                    created_at_ms: now_ms(),
                    ttl_ms: 60_000,
                    hits: 0,
                },
            )
            .await
            .unwrap();
        let cache = cache_with(store.clone());

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("price:EURUSD").await })
        };
        store.entered.notified().await;

        let deleter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.delete("price:EURUSD").await })
        };
        while cache.inner.state.lock().loads["price:EURUSD"].generation == 0 {
            tokio::task::yield_now().await;
        }

        store.release.add_permits(1);
        assert_eq!(reader.await.unwrap(), Some(json!({ "bid": 1.1 })));
        assert!(deleter.await.unwrap());

        assert!(!in_memory(&cache, "price:EURUSD"));
        assert_eq!(cache.get("price:EURUSD").await, None);
        assert!(cache.inner.state.lock().loads.is_empty());
    }

    #[tokio::test]
    async fn write_during_persistent_read_wins() {
        let store = Arc::new(GatedStore::new());
        store
            .inner
            .save(
                "price:EURUSD",
                &PersistedEntry {
                    value: json!({ "bid": 1.1 }),
                    created_at_ms: now_ms(),
                    ttl_ms: 60_000,
                    hits: 0,
                },
            )
            .await
            .unwrap();
        let cache = cache_with(store.clone());

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("price:EURUSD").await })
        };
        store.entered.notified().await;
        cache.set("price:EURUSD", json!({ "bid": 1.2 }), None);

        store.release.add_permits(1);
        reader.await.unwrap();

        assert_eq!(cache.get("price:EURUSD").await, Some(json!({ "bid": 1.2 })));
    }

    #[tokio::test]
    async fn sweep_removes_expired_everywhere() {
        let (cache, store) = cache();
        cache.set("short", json!(1), Some(Duration::from_millis(10)));
        cache.set("long", json!(2), Some(Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let report = cache.sweep_expired().await;

        assert_eq!(report.memory_removed, 1);
        assert_eq!(report.persistent_removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn json_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Position {
            symbol: String,
            qty: i64,
        }

        let (cache, _) = cache();
        let position = Position {
            symbol: "EURUSD".to_string(),
            qty: 3,
        };
        cache.set_json("trading:positions", &position, None).unwrap();

        let loaded: Option<Position> = cache.get_json("trading:positions").await.unwrap();
        assert_eq!(loaded, Some(position));

        cache.set("bad", json!("not a position"), None);
        assert!(cache.get_json::<Position>("bad").await.is_err());
    }

    #[tokio::test]
    async fn store_read_failure_is_a_miss() {
        let mut store = MockPersistentStore::new();
        store
            .expect_load()
            .with(eq("missing"))
            .returning(|_| Err(StoreError::InvalidKey("broken".to_string())));
        store
            .expect_footprint()
            .returning(|| Ok(crate::application::ports::StoreFootprint::default()));
        let cache = cache_with(Arc::new(store));

        assert_eq!(cache.get("missing").await, None);
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn store_write_failure_keeps_memory_value() {
        let mut store = MockPersistentStore::new();
        store
            .expect_save()
            .returning(|_, _| Err(StoreError::InvalidKey("read-only".to_string())));
        let cache = cache_with(Arc::new(store));

        cache.set("k", json!(1), None);
        cache.flush().await;

        assert_eq!(cache.get("k").await, Some(json!(1)));
    }

    #[test]
    fn hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!(CacheStats::default().hit_rate().abs() < f64::EPSILON);
    }
}
