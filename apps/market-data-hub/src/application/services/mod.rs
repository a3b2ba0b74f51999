//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SubscriptionMultiplexer`: Refcounted interest and frame routing
//! - `MarketRecorder`: Caches and publishes routed frames
//! - `CacheSnapshotSource`: Builds rule snapshots from the cache
//! - `NotificationRuleEngine`: Evaluates rules and raises alerts
//! - `ConnectionStatusPublisher`: Mirrors connection lifecycle on the bus

pub mod multiplexer;
pub mod notifications;
pub mod recorder;
pub mod snapshot;
pub mod status;

pub use multiplexer::{FrameHandler, InterestHandle, SubscriptionMultiplexer};
pub use notifications::{NotificationRuleEngine, RuleEngineConfig};
pub use recorder::MarketRecorder;
pub use snapshot::{CacheSnapshotSource, POSITIONS_KEY, SIGNALS_KEY};
pub use status::ConnectionStatusPublisher;
