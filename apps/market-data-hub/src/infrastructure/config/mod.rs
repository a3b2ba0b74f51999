//! Configuration Module
//!
//! Configuration loading for the hub.

mod settings;

pub use settings::{
    CacheSettings, ConfigError, FeedSettings, HubConfig, RuleSettings, ServerSettings,
};
