//! Persistent Store Port (Driven Port)
//!
//! Interface for the slow tier of the dual-tier cache. Entries carry their
//! own creation time and TTL so validity survives restarts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entry as stored in the persistent tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    /// Cached payload.
    pub value: Value,
    /// Creation time, epoch milliseconds.
    pub created_at_ms: u64,
    /// Time to live, milliseconds.
    pub ttl_ms: u64,
    /// Hit counter at the time of the write.
    #[serde(default)]
    pub hits: u64,
}

impl PersistedEntry {
    /// Whether the entry is still valid at `now_ms`.
    #[must_use]
    pub const fn is_valid(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) < self.ttl_ms
    }
}

/// Size of the persistent tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreFootprint {
    /// Stored entries.
    pub entries: usize,
    /// Approximate bytes on the medium.
    pub bytes: u64,
}

/// Persistent store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O failure.
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored document is not a valid entry.
    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key cannot be stored.
    #[error("Invalid store key: {0}")]
    InvalidKey(String),
}

/// Port for the persistent cache tier.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read an entry.
    async fn load(&self, key: &str) -> Result<Option<PersistedEntry>, StoreError>;

    /// Write an entry, replacing any previous one.
    async fn save(&self, key: &str, entry: &PersistedEntry) -> Result<(), StoreError>;

    /// Remove an entry. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<(), StoreError>;

    /// All stored keys.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Entry count and byte size.
    async fn footprint(&self) -> Result<StoreFootprint, StoreError>;
}
