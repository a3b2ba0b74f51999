//! Application Ports (Driver and Driven)
//!
//! Ports define interfaces for interacting with external systems.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: Opens the text-frame link to the upstream feed
//! - `PersistentStore`: Slow tier of the dual-tier cache
//! - `UpstreamSubscriptions`: Sends subscribe/unsubscribe control messages
//! - `ActionChannel`: Delivers a fired alert over one channel
//!
//! ## Driver Ports (Inbound)
//!
//! - `SnapshotSource`: Supplies the JSON snapshot notification rules read

mod action_port;
mod snapshot_source_port;
mod store_port;
mod transport_port;
mod upstream_port;

pub use action_port::{ActionChannel, ActionError};
pub use snapshot_source_port::SnapshotSource;
#[cfg(test)]
pub use store_port::MockPersistentStore;
pub use store_port::{PersistedEntry, PersistentStore, StoreError, StoreFootprint};
pub use transport_port::{Transport, TransportError, TransportLink};
pub use upstream_port::UpstreamSubscriptions;
