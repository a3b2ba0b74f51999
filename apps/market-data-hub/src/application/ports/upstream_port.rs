//! Upstream Subscription Port (Driven Port)
//!
//! The multiplexer calls this exactly once per key when its reference count
//! crosses zero. The connection manager implements it.

use crate::domain::subscription::SubscriptionKey;

/// Port for upstream subscribe/unsubscribe control messages.
pub trait UpstreamSubscriptions: Send + Sync {
    /// Start streaming a key.
    fn subscribe(&self, key: &SubscriptionKey);

    /// Stop streaming a key.
    fn unsubscribe(&self, key: &SubscriptionKey);
}
