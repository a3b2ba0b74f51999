//! Prometheus Metrics Module
//!
//! Exposes hub metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Feed**: Connection state, reconnect attempts, frames by kind
//! - **Bus**: Published events by topic family
//! - **Cache**: Hits, misses, evictions, persistence failures
//! - **Rules**: Alerts raised and action delivery failures
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::market::DataKind;
use crate::domain::rules::{ActionType, Severity};
use crate::infrastructure::feed::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Feed
    describe_gauge!(
        "market_hub_connection_state",
        "Upstream connection state (1 for the current state, 0 otherwise)"
    );
    describe_counter!(
        "market_hub_reconnect_attempts_total",
        "Total upstream reconnection attempts"
    );
    describe_counter!(
        "market_hub_frames_received_total",
        "Market data frames received from the upstream feed"
    );
    describe_counter!(
        "market_hub_malformed_frames_total",
        "Inbound frames that could not be decoded"
    );

    // Bus
    describe_counter!(
        "market_hub_bus_events_total",
        "Events published on the internal bus"
    );

    // Cache
    describe_counter!("market_hub_cache_hits_total", "Cache reads that found a value");
    describe_counter!("market_hub_cache_misses_total", "Cache reads that found nothing");
    describe_counter!(
        "market_hub_cache_evictions_total",
        "Entries evicted from the memory tier"
    );
    describe_counter!(
        "market_hub_cache_persist_failures_total",
        "Failed writes to the persistent tier"
    );

    // Rules
    describe_counter!(
        "market_hub_alerts_triggered_total",
        "Alerts raised by notification rules"
    );
    describe_counter!(
        "market_hub_action_failures_total",
        "Notification actions that failed to deliver"
    );
    describe_gauge!(
        "market_hub_active_interests",
        "Registered interest handlers across all keys"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

const STATES: [ConnectionState; 5] = [
    ConnectionState::Disconnected,
    ConnectionState::Connecting,
    ConnectionState::Connected,
    ConnectionState::Reconnecting,
    ConnectionState::Terminated,
];

/// Publish the current connection state as a one-hot gauge.
pub fn set_connection_state(current: ConnectionState) {
    for state in STATES {
        gauge!("market_hub_connection_state", "state" => state.as_str())
            .set(if state == current { 1.0 } else { 0.0 });
    }
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect_attempt() {
    counter!("market_hub_reconnect_attempts_total").increment(1);
}

/// Record an undecodable inbound frame.
pub fn record_malformed_frame() {
    counter!("market_hub_malformed_frames_total").increment(1);
}

/// Label for a data kind. Timeframes collapse into `ohlc`.
const fn kind_label(kind: DataKind) -> &'static str {
    match kind {
        DataKind::Price => "price",
        DataKind::Depth => "depth",
        DataKind::Ohlc(_) => "ohlc",
    }
}

/// Record a market data frame received from the feed.
pub fn record_frame_received(kind: DataKind) {
    counter!("market_hub_frames_received_total", "kind" => kind_label(kind)).increment(1);
}

/// Topic family label: the part before the first `:`.
fn topic_family(topic: &str) -> String {
    topic.split(':').next().unwrap_or(topic).to_string()
}

/// Record an event published on the bus.
pub fn record_bus_publish(topic: &str) {
    counter!("market_hub_bus_events_total", "family" => topic_family(topic)).increment(1);
}

/// Record a cache hit.
pub fn record_cache_hit() {
    counter!("market_hub_cache_hits_total").increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!("market_hub_cache_misses_total").increment(1);
}

/// Record memory-tier evictions.
pub fn record_cache_evictions(count: u64) {
    if count > 0 {
        counter!("market_hub_cache_evictions_total").increment(count);
    }
}

/// Record a failed persistent-tier write.
pub fn record_persist_failure() {
    counter!("market_hub_cache_persist_failures_total").increment(1);
}

/// Record an alert raised by a rule.
pub fn record_alert_triggered(severity: Severity) {
    counter!("market_hub_alerts_triggered_total", "severity" => severity.as_str()).increment(1);
}

/// Record an action that failed to deliver.
pub fn record_action_failure(channel: ActionType) {
    counter!("market_hub_action_failures_total", "channel" => channel.as_str()).increment(1);
}

/// Update the registered interest handler count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_interests(count: usize) {
    gauge!("market_hub_active_interests").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
