//! Subscription Tracking Types
//!
//! Domain types for tracking local interest in market data streams.
//!
//! # Design
//!
//! The interest registry tracks:
//! - Which handlers are registered for each `(symbol, kind)` key, in order
//! - Reference counts that decide when the upstream stream is needed
//!
//! This allows many consumers to share one upstream subscription per key.
//! The registry is a plain data structure; callers provide the locking.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::market::{DataKind, Timeframe};

// =============================================================================
// Types
// =============================================================================

/// Identifier of one registered handler.
pub type HandlerId = u64;

/// A `(symbol, kind)` pair identifying one logical upstream stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    symbol: String,
    kind: DataKind,
}

impl SubscriptionKey {
    /// Create a key. The symbol is normalised to upper case.
    #[must_use]
    pub fn new(symbol: impl AsRef<str>, kind: DataKind) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_uppercase(),
            kind,
        }
    }

    /// Price key for a symbol.
    #[must_use]
    pub fn price(symbol: impl AsRef<str>) -> Self {
        Self::new(symbol, DataKind::Price)
    }

    /// Depth key for a symbol.
    #[must_use]
    pub fn depth(symbol: impl AsRef<str>) -> Self {
        Self::new(symbol, DataKind::Depth)
    }

    /// OHLC key for a symbol and timeframe.
    #[must_use]
    pub fn ohlc(symbol: impl AsRef<str>, timeframe: Timeframe) -> Self {
        Self::new(symbol, DataKind::Ohlc(timeframe))
    }

    /// The symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// The data kind.
    #[must_use]
    pub const fn kind(&self) -> DataKind {
        self.kind
    }

    /// Cache key holding the latest value for this stream.
    #[must_use]
    pub fn cache_key(&self) -> String {
        self.kind.cache_key(&self.symbol)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.symbol)
    }
}

// =============================================================================
// Upstream Change
// =============================================================================

/// Upstream action required after a registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamChange {
    /// Reference count went 0→1; subscribe upstream.
    Subscribe,
    /// Reference count went 1→0; unsubscribe upstream.
    Unsubscribe,
    /// Reference count changed without crossing zero.
    None,
}

// =============================================================================
// Interest Registry
// =============================================================================

/// Ordered handlers for each key plus a reverse index from handler to key.
///
/// The reference count of a key is the number of its registered handlers.
///
/// # Example
///
/// ```rust
/// use market_data_hub::domain::subscription::{InterestRegistry, SubscriptionKey, UpstreamChange};
///
/// let mut registry = InterestRegistry::new();
/// let key = SubscriptionKey::price("EURUSD");
///
/// let (first, change) = registry.add(key.clone(), "widget");
/// assert_eq!(change, UpstreamChange::Subscribe);
///
/// let (second, change) = registry.add(key.clone(), "alerts");
/// assert_eq!(change, UpstreamChange::None);
///
/// assert_eq!(registry.remove(first), Some((key.clone(), UpstreamChange::None)));
/// assert_eq!(registry.remove(second), Some((key, UpstreamChange::Unsubscribe)));
/// ```
#[derive(Debug)]
pub struct InterestRegistry<H> {
    next_id: HandlerId,
    by_key: HashMap<SubscriptionKey, Vec<(HandlerId, H)>>,
    by_handler: HashMap<HandlerId, SubscriptionKey>,
}

impl<H> Default for InterestRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> InterestRegistry<H> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            by_key: HashMap::new(),
            by_handler: HashMap::new(),
        }
    }

    /// Register a handler for a key.
    ///
    /// Returns the new handler id and whether the key needs an upstream subscribe.
    pub fn add(&mut self, key: SubscriptionKey, handler: H) -> (HandlerId, UpstreamChange) {
        let id = self.next_id;
        self.next_id += 1;

        let handlers = self.by_key.entry(key.clone()).or_default();
        handlers.push((id, handler));
        let change = if handlers.len() == 1 {
            UpstreamChange::Subscribe
        } else {
            UpstreamChange::None
        };

        self.by_handler.insert(id, key);
        (id, change)
    }

    /// Remove a handler.
    ///
    /// Returns its key and whether the key needs an upstream unsubscribe,
    /// or `None` if the handler was not registered.
    pub fn remove(&mut self, id: HandlerId) -> Option<(SubscriptionKey, UpstreamChange)> {
        let key = self.by_handler.remove(&id)?;

        let Some(handlers) = self.by_key.get_mut(&key) else {
            return Some((key, UpstreamChange::None));
        };
        handlers.retain(|(handler_id, _)| *handler_id != id);

        if handlers.is_empty() {
            self.by_key.remove(&key);
            Some((key, UpstreamChange::Unsubscribe))
        } else {
            Some((key, UpstreamChange::None))
        }
    }

    /// Handlers registered for a key, in registration order.
    pub fn handlers(&self, key: &SubscriptionKey) -> impl Iterator<Item = &(HandlerId, H)> {
        self.by_key.get(key).into_iter().flatten()
    }

    /// Reference count of a key.
    #[must_use]
    pub fn count(&self, key: &SubscriptionKey) -> usize {
        self.by_key.get(key).map_or(0, Vec::len)
    }

    /// Keys with at least one handler, sorted.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether a handler id is registered.
    #[must_use]
    pub fn contains(&self, id: HandlerId) -> bool {
        self.by_handler.contains_key(&id)
    }

    /// Statistics over the registry.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let mut per_kind: BTreeMap<String, usize> = BTreeMap::new();
        for key in self.by_key.keys() {
            *per_kind.entry(key.kind().to_string()).or_default() += 1;
        }

        SubscriptionStats {
            key_count: self.by_key.len(),
            handler_count: self.by_handler.len(),
            keys_per_kind: per_kind,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SubscriptionStats {
    /// Number of distinct keys with interest.
    pub key_count: usize,
    /// Number of registered handlers.
    pub handler_count: usize,
    /// Distinct keys grouped by kind.
    pub keys_per_kind: BTreeMap<String, usize>,
}

// =============================================================================
// Tests
// =============================================================================
