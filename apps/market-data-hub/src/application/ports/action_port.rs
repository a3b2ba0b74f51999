//! Action Channel Port (Driven Port)
//!
//! Interface for delivering a fired alert over one channel.

use serde_json::Value;

use crate::domain::rules::{ActionType, Alert};

/// Action delivery error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// Channel configuration is missing or invalid.
    #[error("{channel} action misconfigured: {reason}")]
    InvalidConfig {
        /// Channel type.
        channel: ActionType,
        /// Failure.
        reason: String,
    },

    /// Delivery was attempted and failed.
    #[error("{channel} delivery failed: {reason}")]
    DeliveryFailed {
        /// Channel type.
        channel: ActionType,
        /// Failure.
        reason: String,
    },

    /// No channel registered for the type.
    #[error("no channel registered for {0}")]
    Unsupported(ActionType),
}

/// Port for delivering alerts.
pub trait ActionChannel: Send + Sync {
    /// Channel type served.
    fn action_type(&self) -> ActionType;

    /// Deliver one alert with the action's optional configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or delivery fails.
    fn deliver(&self, alert: &Alert, config: Option<&Value>) -> Result<(), ActionError>;
}
