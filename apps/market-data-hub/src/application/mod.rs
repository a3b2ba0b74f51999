//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services, the port interfaces that
//! define how the domain interacts with external systems, and the context
//! that wires them together.

/// Hub wiring and lifecycle.
pub mod context;

/// Port interfaces for external systems (transport, store, actions).
pub mod ports;

/// Application services for routing, recording and notifications.
pub mod services;
