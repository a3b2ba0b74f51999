#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Data Hub - Streaming Fan-out, Cache and Alerts
//!
//! Keeps one resilient connection to an upstream market data feed,
//! multiplexes local interest onto it, caches the latest state in a
//! dual-tier cache and evaluates notification rules against that state.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core market data types and business logic
//!   - `market`: Price ticks, depth snapshots, OHLC bars
//!   - `subscription`: Subscription keys and reference counting
//!   - `rules`: Notification rules, conditions and alerts
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport, persistent store, snapshot source, action channel
//!   - `services`: Multiplexer, recorder, rule engine, status publisher
//!   - `context`: Builds and owns every component
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feed`: Upstream connection, WebSocket and scripted transports
//!   - `cache`: Memory LRU tier and persistent stores
//!   - `bus`: Topic publish/subscribe with `prefix:*` wildcards
//!   - `actions`: Alert delivery channels
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                  ┌────────────┐   ┌─────────────┐   ┌──────────┐
//! Upstream feed ──►│ Connection │──►│ Multiplexer │──►│ Recorder │
//!                  │  Manager   │   └─────────────┘   └────┬─────┘
//!                  └────────────┘                          │
//!                        ▲            ┌───────────┐◄───────┤
//!                        │            │ Dual-tier │        ▼
//!               subscribe/unsubscribe │   Cache   │   ┌──────────┐
//!                                     └─────┬─────┘   │ EventBus │──► consumers
//!                                           │         └──────────┘
//!                                           ▼              ▲
//!                                     ┌────────────┐       │
//!                                     │ Rule Engine│───────┘ notification:triggered
//!                                     └────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    DataKind, DepthLevel, DepthSnapshot, MarketFrame, OhlcBar, PriceTick, Timeframe,
};
pub use domain::rules::{
    Action, ActionType, Alert, Condition, Logic, NotificationRule, Operator, RuleError, Severity,
};
pub use domain::subscription::{SubscriptionKey, SubscriptionStats};

// Application
pub use application::context::{HubContext, HubError};
pub use application::services::{
    CacheSnapshotSource, ConnectionStatusPublisher, InterestHandle, MarketRecorder,
    NotificationRuleEngine, RuleEngineConfig, SubscriptionMultiplexer,
};

// Infrastructure config
pub use infrastructure::config::{
    CacheSettings, ConfigError, FeedSettings, HubConfig, RuleSettings, ServerSettings,
};

// Feed
pub use infrastructure::feed::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionSnapshot,
    ConnectionState, Credentials, WebSocketTransport,
};
#[cfg(any(test, feature = "testing"))]
pub use infrastructure::feed::{MockServer, MockTransport, OpenOutcome};

// Cache and bus
pub use infrastructure::bus::{BusEvent, BusSubscription, EventBus, topics};
pub use infrastructure::cache::{
    CacheConfig, CacheError, CacheStats, DualTierCache, FileStore, InMemoryStore,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
