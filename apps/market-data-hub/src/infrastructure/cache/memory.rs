//! Memory Tier
//!
//! Byte-budgeted, strictly LRU-ordered map of cache entries. Recency is a
//! monotonically increasing tick per entry, indexed by a `BTreeMap` so the
//! least recently used key is always the first entry of the index.
//!
//! This type does no locking and reads no clock; the cache facade passes
//! `now_ms` in and serializes access.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::application::ports::PersistedEntry;

/// One cached value.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Payload.
    pub value: Value,
    /// Creation time, epoch milliseconds.
    pub created_at_ms: u64,
    /// Time to live, milliseconds.
    pub ttl_ms: u64,
    /// Reads served from this entry.
    pub hits: u64,
    /// Estimated footprint in bytes.
    pub size: usize,
    tick: u64,
}

impl CacheEntry {
    /// Whether the entry is still valid at `now_ms`.
    #[must_use]
    pub const fn is_valid(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) < self.ttl_ms
    }

    /// Persisted representation.
    #[must_use]
    pub fn to_persisted(&self) -> PersistedEntry {
        PersistedEntry {
            value: self.value.clone(),
            created_at_ms: self.created_at_ms,
            ttl_ms: self.ttl_ms,
            hits: self.hits,
        }
    }
}

/// Estimated footprint of a key/value pair.
#[must_use]
pub fn estimate_size(key: &str, value: &Value) -> usize {
    key.len() + serde_json::to_vec(value).map_or(0, |bytes| bytes.len())
}

/// Result of a memory lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Valid entry.
    Hit(Value),
    /// Entry existed but had expired; it was removed.
    Expired,
    /// No entry.
    Miss,
}

/// LRU memory tier.
#[derive(Debug)]
pub struct MemoryTier {
    entries: HashMap<String, CacheEntry>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    bytes: usize,
    budget: usize,
}

impl MemoryTier {
    /// Create an empty tier with a byte budget.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            bytes: 0,
            budget,
        }
    }

    /// Insert or replace an entry and make it most recently used.
    ///
    /// Returns the keys evicted to get back under budget.
    pub fn insert(
        &mut self,
        key: &str,
        value: Value,
        created_at_ms: u64,
        ttl_ms: u64,
        hits: u64,
    ) -> Vec<String> {
        self.remove(key);

        let size = estimate_size(key, &value);
        let tick = self.bump();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at_ms,
                ttl_ms,
                hits,
                size,
                tick,
            },
        );
        self.recency.insert(tick, key.to_string());
        self.bytes += size;

        self.enforce_budget()
    }

    /// Look up a key at `now_ms`. A hit becomes most recently used.
    pub fn get(&mut self, key: &str, now_ms: u64) -> Lookup {
        let Some(entry) = self.entries.get(key) else {
            return Lookup::Miss;
        };

        if !entry.is_valid(now_ms) {
            self.remove(key);
            return Lookup::Expired;
        }

        let old_tick = entry.tick;
        let tick = self.bump();
        self.recency.remove(&old_tick);
        self.recency.insert(tick, key.to_string());

        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.tick = tick;
                entry.hits += 1;
                Lookup::Hit(entry.value.clone())
            }
            None => Lookup::Miss,
        }
    }

    /// Entry for a key without touching recency.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Remove a key. Returns whether it existed.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.tick);
                self.bytes -= entry.size;
                true
            }
            None => false,
        }
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.bytes = 0;
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_valid(now_ms))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.recency.values().map(String::as_str)
    }

    /// Estimated footprint.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    /// Byte budget.
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.budget
    }

    /// Entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tier is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    const fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn enforce_budget(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.bytes > self.budget {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes -= entry.size;
            }
            evicted.push(key);
        }
        evicted
    }
}
