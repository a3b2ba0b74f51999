//! Hub Configuration Settings
//!
//! Configuration types for the hub, loaded from environment variables.
//! Loading goes through a lookup function so tests can supply variables
//! without touching the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::market::Timeframe;
use crate::infrastructure::cache::CacheConfig;
use crate::infrastructure::feed::Credentials;

/// Upstream feed settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Feed endpoint URL.
    pub url: String,
    /// API credentials, when the feed requires them.
    pub credentials: Option<Credentials>,
    /// Refuse to connect without credentials.
    pub require_auth: bool,
    /// Heartbeat check interval.
    pub heartbeat_interval: Duration,
    /// Silence after which the link is considered dead.
    pub heartbeat_timeout: Duration,
    /// Base reconnection delay.
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Jitter fraction applied to reconnection delays.
    pub reconnect_jitter: f64,
    /// Retries before giving up.
    pub max_reconnect_attempts: u32,
    /// Capacity of the connection event channel.
    pub event_capacity: usize,
}

impl FeedSettings {
    /// Settings for `url` with every other field at its default.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            require_auth: false,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(3600),
            reconnect_jitter: 0.0,
            max_reconnect_attempts: 5,
            event_capacity: 1024,
        }
    }
}

/// Cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Memory tier byte budget.
    pub max_memory_bytes: usize,
    /// Default entry TTL.
    pub default_ttl: Duration,
    /// TTL for order-book depth.
    pub depth_ttl: Duration,
    /// Expiry sweep interval.
    pub sweep_interval: Duration,
    /// Directory for the file-backed persistent tier (in-memory when unset).
    pub store_dir: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_memory_bytes: 50 * 1024 * 1024,
            default_ttl: Duration::from_millis(300_000),
            depth_ttl: Duration::from_millis(60_000),
            sweep_interval: Duration::from_secs(300),
            store_dir: None,
        }
    }
}

impl CacheSettings {
    /// Cache tuning derived from these settings.
    #[must_use]
    pub const fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_memory_bytes: self.max_memory_bytes,
            default_ttl: self.default_ttl,
            sweep_interval: self.sweep_interval,
        }
    }
}

/// Notification rule settings.
#[derive(Debug, Clone)]
pub struct RuleSettings {
    /// Evaluation cadence.
    pub tick_interval: Duration,
    /// Minimum time between two alerts of one rule.
    pub refire_interval: Duration,
    /// JSON file of rules loaded at startup.
    pub rules_file: Option<PathBuf>,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            refire_interval: Duration::from_secs(5),
            rules_file: None,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Complete hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upstream feed settings.
    pub feed: FeedSettings,
    /// Cache settings.
    pub cache: CacheSettings,
    /// Rule engine settings.
    pub rules: RuleSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Symbols to subscribe at startup.
    pub symbols: Vec<String>,
    /// Timeframes one OHLC interest fans out to.
    pub ohlc_timeframes: Vec<Timeframe>,
}

impl HubConfig {
    /// Configuration for `url` with every other field at its default.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            feed: FeedSettings::new(url),
            cache: CacheSettings::default(),
            rules: RuleSettings::default(),
            server: ServerSettings::default(),
            symbols: Vec::new(),
            ohlc_timeframes: Timeframe::DEFAULT_FAN_OUT.to_vec(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or any value is
    /// malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or any value is
    /// malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let url = env.required("FEED_URL")?;
        let mut config = Self::new(url);

        let credentials = match (env.get("FEED_API_KEY"), env.get("FEED_API_SECRET")) {
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingEnvVar("FEED_API_SECRET".into())),
            (None, Some(_)) => return Err(ConfigError::MissingEnvVar("FEED_API_KEY".into())),
            (Some(key), Some(secret)) => Some(
                Credentials::new(key, secret)
                    .map_err(|_| ConfigError::EmptyValue("FEED_API_KEY/FEED_API_SECRET".into()))?,
            ),
        };

        let feed = &mut config.feed;
        feed.require_auth = env.bool_or("FEED_REQUIRE_AUTH", credentials.is_some())?;
        feed.credentials = credentials;
        feed.heartbeat_interval =
            env.secs_or("FEED_HEARTBEAT_INTERVAL_SECS", feed.heartbeat_interval)?;
        feed.heartbeat_timeout = env.secs_or("FEED_HEARTBEAT_TIMEOUT_SECS", feed.heartbeat_timeout)?;
        feed.reconnect_delay = env.millis_or("FEED_RECONNECT_DELAY_MS", feed.reconnect_delay)?;
        feed.reconnect_delay_max =
            env.secs_or("FEED_RECONNECT_DELAY_MAX_SECS", feed.reconnect_delay_max)?;
        feed.reconnect_jitter = env.parse_or("FEED_RECONNECT_JITTER", feed.reconnect_jitter)?;
        feed.max_reconnect_attempts =
            env.parse_or("FEED_MAX_RECONNECT_ATTEMPTS", feed.max_reconnect_attempts)?;
        feed.event_capacity = env.parse_or("FEED_EVENT_CAPACITY", feed.event_capacity)?;

        if !(0.0..=1.0).contains(&feed.reconnect_jitter) {
            return Err(ConfigError::InvalidValue {
                key: "FEED_RECONNECT_JITTER".into(),
                value: feed.reconnect_jitter.to_string(),
                reason: "must be between 0 and 1".into(),
            });
        }
        if feed.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FEED_EVENT_CAPACITY".into(),
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }

        let cache = &mut config.cache;
        cache.max_memory_bytes = env.parse_or("CACHE_MAX_MEMORY_BYTES", cache.max_memory_bytes)?;
        cache.default_ttl = env.millis_or("CACHE_DEFAULT_TTL_MS", cache.default_ttl)?;
        cache.depth_ttl = env.millis_or("CACHE_DEPTH_TTL_MS", cache.depth_ttl)?;
        cache.sweep_interval = env.secs_or("CACHE_SWEEP_INTERVAL_SECS", cache.sweep_interval)?;
        cache.store_dir = env.get("CACHE_STORE_DIR").map(PathBuf::from);

        let rules = &mut config.rules;
        rules.tick_interval = env.millis_or("RULES_TICK_INTERVAL_MS", rules.tick_interval)?;
        rules.refire_interval = env.millis_or("RULES_REFIRE_INTERVAL_MS", rules.refire_interval)?;
        rules.rules_file = env.get("HUB_RULES_FILE").map(PathBuf::from);

        config.server.health_port = env.parse_or("HUB_HEALTH_PORT", config.server.health_port)?;

        if let Some(symbols) = env.get("HUB_SYMBOLS") {
            config.symbols = split_list(&symbols)
                .map(str::to_uppercase)
                .collect();
        }

        if let Some(raw) = env.get("HUB_OHLC_TIMEFRAMES") {
            let timeframes = split_list(&raw)
                .map(|tf| {
                    Timeframe::from_str(tf).map_err(|e| ConfigError::InvalidValue {
                        key: "HUB_OHLC_TIMEFRAMES".into(),
                        value: tf.to_string(),
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if timeframes.is_empty() {
                return Err(ConfigError::EmptyValue("HUB_OHLC_TIMEFRAMES".into()));
            }
            config.ohlc_timeframes = timeframes;
        }

        Ok(config)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable does not parse.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: v,
                reason: "expected a boolean".into(),
            }),
        }
    }

    fn secs_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(key)
            .map_or(Ok(default), |_| self.parse_or(key, 0u64).map(Duration::from_secs))
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(key)
            .map_or(Ok(default), |_| self.parse_or(key, 0u64).map(Duration::from_millis))
    }
}
