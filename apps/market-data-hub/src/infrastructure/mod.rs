//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Alert delivery channels.
pub mod actions;

/// In-process publish/subscribe bus.
pub mod bus;

/// Dual-tier (memory + persistent) cache.
pub mod cache;

/// Configuration loading.
pub mod config;

/// Upstream feed connection and transports.
pub mod feed;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
