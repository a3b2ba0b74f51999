//! Domain Layer - Core market data types and business logic.
//!
//! This layer contains the core domain types for market data distribution
//! and notification rules with no I/O. All types here are pure Rust with
//! serialization support.

/// Market data types (price ticks, depth, OHLC bars).
pub mod market;

/// Subscription keys and reference-counted interest tracking.
pub mod subscription;

/// Notification rules, conditions and alerts.
pub mod rules;
