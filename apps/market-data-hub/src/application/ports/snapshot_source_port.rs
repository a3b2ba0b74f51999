//! Snapshot Source Port (Driver Port)
//!
//! Supplies the JSON document notification rules are evaluated against.

use async_trait::async_trait;
use serde_json::Value;

/// Port for reading the latest market snapshot.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Build the current snapshot.
    async fn snapshot(&self) -> Value;
}
