//! Event Bus
//!
//! In-process publish/subscribe with trailing-wildcard topic patterns.
//!
//! # Topics
//!
//! Topics are `namespace:event`, e.g. `market:price_update`,
//! `connection:connected` or `notification:triggered`. A subscription
//! pattern is either an exact topic, a prefix ending in `*` (`market:*`),
//! or `*` for everything.
//!
//! # Delivery
//!
//! `publish` calls matching callbacks synchronously on the publishing
//! thread, in subscription order, from a snapshot of the subscriber list.
//! Callbacks may subscribe or unsubscribe while being called; a subscriber
//! removed mid-dispatch is not called again. There is no buffering or replay.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::infrastructure::metrics;

// =============================================================================
// Topics
// =============================================================================

/// Well-known topics.
pub mod topics {
    /// Upstream connection established.
    pub const CONNECTION_CONNECTED: &str = "connection:connected";
    /// Upstream connection lost or closed.
    pub const CONNECTION_DISCONNECTED: &str = "connection:disconnected";
    /// Upstream connection error.
    pub const CONNECTION_ERROR: &str = "connection:error";
    /// Upstream reconnect scheduled.
    pub const CONNECTION_RECONNECTING: &str = "connection:reconnecting";
    /// A notification rule fired.
    pub const NOTIFICATION_TRIGGERED: &str = "notification:triggered";
    /// In-app notification request.
    pub const UI_NOTIFICATION: &str = "ui:notification";
    /// Sound cue request.
    pub const UI_SOUND: &str = "ui:sound";
    /// New trading signal.
    pub const SIGNAL_NEW: &str = "signal:new";
    /// Updated trading signal.
    pub const SIGNAL_UPDATE: &str = "signal:update";
    /// Expired trading signal.
    pub const SIGNAL_EXPIRED: &str = "signal:expired";

    /// `market:{event_type}`
    #[must_use]
    pub fn market(event_type: &str) -> String {
        format!("market:{event_type}")
    }

    /// `trading:{event_type}`
    #[must_use]
    pub fn trading(event_type: &str) -> String {
        format!("trading:{event_type}")
    }
}

// =============================================================================
// Event
// =============================================================================

/// An event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusEvent {
    /// Topic the event was published on.
    pub topic: String,
    /// Event payload.
    pub payload: Value,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Optional publisher tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

// =============================================================================
// Topic Pattern
// =============================================================================

/// Parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    /// `*`
    All,
    /// `prefix*`
    Prefix(String),
    /// Exact topic.
    Exact(String),
}

impl TopicPattern {
    /// Parse a pattern.
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some("") => Self::All,
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(pattern.to_string()),
        }
    }

    /// Whether `topic` matches.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            Self::Exact(exact) => topic == exact,
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
            Self::Exact(exact) => f.write_str(exact),
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Subscriber callback.
pub type BusCallback = Arc<dyn Fn(&BusEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    pattern: TopicPattern,
    active: Arc<AtomicBool>,
    callback: BusCallback,
}

struct BusInner {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }
}

/// In-process event bus.
///
/// Cheap to clone; clones share subscribers.
///
/// # Example
///
/// ```rust
/// use market_data_hub::infrastructure::bus::EventBus;
/// use serde_json::json;
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
///
/// let bus = EventBus::new();
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
///
/// let subscription = bus.subscribe("market:*", move |_event| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// assert_eq!(bus.publish("market:price_update", json!({}), None), 1);
/// assert_eq!(bus.publish("trading:fill", json!({}), None), 0);
///
/// subscription.unsubscribe();
/// assert_eq!(bus.publish("market:price_update", json!({}), None), 0);
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish an event. Returns how many subscribers received it.
    pub fn publish(&self, topic: &str, payload: Value, source: Option<&str>) -> usize {
        let snapshot: Vec<Arc<Subscriber>> = self
            .inner
            .subscribers
            .read()
            .iter()
            .filter(|s| s.pattern.matches(topic))
            .cloned()
            .collect();

        metrics::record_bus_publish(topic);
        if snapshot.is_empty() {
            return 0;
        }

        let event = BusEvent {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
            source: source.map(str::to_string),
        };

        let mut delivered = 0;
        for subscriber in snapshot {
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }

            let callback = Arc::clone(&subscriber.callback);
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_ok() {
                delivered += 1;
            } else {
                tracing::error!(
                    topic = %event.topic,
                    subscriber = subscriber.id,
                    pattern = %subscriber.pattern,
                    "Event bus subscriber panicked"
                );
            }
        }
        delivered
    }

    /// Subscribe a callback to a topic pattern.
    pub fn subscribe<F>(&self, pattern: &str, callback: F) -> BusSubscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));

        self.inner.subscribers.write().push(Arc::new(Subscriber {
            id,
            pattern: TopicPattern::parse(pattern),
            active: Arc::clone(&active),
            callback: Arc::new(callback),
        }));
        tracing::trace!(pattern, subscriber = id, "Event bus subscription added");

        BusSubscription {
            id,
            active,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

/// Revocable subscription token.
///
/// Dropping it does not unsubscribe, so fire-and-forget listeners stay
/// registered for the bus lifetime. Keep the token and call
/// [`Self::unsubscribe`] to release the callback.
#[derive(Debug)]
#[must_use = "the callback stays registered until unsubscribe() is called"]
pub struct BusSubscription {
    id: u64,
    active: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

impl BusSubscription {
    /// Stop delivery to this subscriber. Idempotent.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }

    /// Whether the subscription is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn counter(bus: &EventBus, pattern: &str) -> (Arc<AtomicUsize>, BusSubscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&count);
        let subscription = bus.subscribe(pattern, move |_| {
            clone.fetch_add(1, Ordering::SeqCst);
        });
        (count, subscription)
    }

    #[test_case("market:*", "market:price_update", true ; "prefix match")]
    #[test_case("market:*", "marketing:promo", false ; "prefix requires separator")]
    #[test_case("market:*", "trading:fill", false ; "other namespace")]
    #[test_case("*", "ui:sound", true ; "all")]
    #[test_case("ui:sound", "ui:sound", true ; "exact")]
    #[test_case("ui:sound", "ui:sound:extra", false ; "exact is not prefix")]
    fn pattern_matching(pattern: &str, topic: &str, expected: bool) {
        assert_eq!(TopicPattern::parse(pattern).matches(topic), expected);
    }

    #[test]
    fn wildcard_receives_every_market_topic_once() {
        let bus = EventBus::new();
        let (count, _sub) = counter(&bus, "market:*");

        bus.publish("market:price_update", json!({}), None);
        bus.publish("market:depth_update", json!({}), None);
        bus.publish("trading:position", json!({}), None);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn publish_returns_delivered_count() {
        let bus = EventBus::new();
        let (_a, _sa) = counter(&bus, "market:*");
        let (_b, _sb) = counter(&bus, "market:price_update");
        let (_c, _sc) = counter(&bus, "ui:*");

        assert_eq!(bus.publish("market:price_update", json!(1), Some("test")), 2);
    }

    #[test]
    fn event_carries_topic_payload_and_source() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let clone = Arc::clone(&seen);
        let _sub = bus.subscribe("*", move |event| {
            *clone.lock() = Some(event.clone());
        });

        bus.publish("signal:new", json!({ "id": 7 }), Some("engine"));

        let event = seen.lock().clone().unwrap();
        assert_eq!(event.topic, "signal:new");
        assert_eq!(event.payload, json!({ "id": 7 }));
        assert_eq!(event.source.as_deref(), Some("engine"));
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let (count, sub) = counter(&bus, "*");

        sub.unsubscribe();
        sub.unsubscribe();

        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish("x:y", json!(null), None), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_token_keeps_subscription() {
        let bus = EventBus::new();
        let (count, sub) = counter(&bus, "*");
        drop(sub);

        bus.publish("x:y", json!(null), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_during_dispatch_skips_later_subscriber() {
        let bus = EventBus::new();
        let victim: Arc<Mutex<Option<BusSubscription>>> = Arc::new(Mutex::new(None));

        let victim_clone = Arc::clone(&victim);
        let _first = bus.subscribe("*", move |_| {
            if let Some(sub) = victim_clone.lock().as_ref() {
                sub.unsubscribe();
            }
        });
        let (count, second) = counter(&bus, "*");
        *victim.lock() = Some(second);

        let delivered = bus.publish("x:y", json!(null), None);

        assert_eq!(delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribe_during_dispatch_is_safe() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        let added = Arc::new(Mutex::new(Vec::new()));

        let added_clone = Arc::clone(&added);
        let _sub = bus.subscribe("*", move |_| {
            added_clone.lock().push(inner_bus.subscribe("*", |_| {}));
        });

        assert_eq!(bus.publish("x:y", json!(null), None), 1);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let _bad = bus.subscribe("*", |_| panic!("boom"));
        let (count, _good) = counter(&bus, "*");

        let delivered = bus.publish("x:y", json!(null), None);

        assert_eq!(delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
