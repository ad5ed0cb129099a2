//! Configuration management for racestream.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::batcher::DEFAULT_BATCH_INTERVAL;
use crate::connection::DEFAULT_BACKOFF_SCHEDULE_MS;
use crate::error::{Error, Result};
use crate::metrics::{DEFAULT_DEGRADED_AFTER, DEFAULT_RATE_WINDOW};
use crate::model::FreshnessThresholds;
use crate::notify::{Interest, DEFAULT_SEEN_LIMIT, DEFAULT_SEEN_TRIM_TO};
use crate::session::SessionConfig;
use crate::store::DEFAULT_MAX_RECENT_CROSSINGS;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default config directory name.
const CONFIG_DIR_NAME: &str = "racestream";

/// Environment variable prefix.
const ENV_PREFIX: &str = "RACESTREAM_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `RACESTREAM_`, sections separated
///    by `__`, e.g. `RACESTREAM_SERVER__BASE_URL`)
/// 2. TOML config file at `~/.config/racestream/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server connection configuration.
    pub server: ServerConfig,
    /// Live stream tuning.
    pub stream: StreamConfig,
    /// Checkpoint notification configuration.
    pub notifications: NotificationConfig,
    /// Data freshness thresholds.
    pub freshness: FreshnessConfig,
}

/// Server connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the race cloud service.
    pub base_url: String,
    /// Bearer token sent in the `Authorization` header.
    pub token: Option<String>,
    /// Timeout for REST requests, and connect timeout for the stream.
    pub request_timeout_secs: u64,
}

/// Live stream tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Position batch window in milliseconds.
    pub batch_interval_ms: u64,
    /// Reconnect delays in milliseconds; the last entry repeats.
    pub backoff_schedule_ms: Vec<u64>,
    /// Consecutive failures before the connection is reported degraded.
    pub degraded_after: u32,
    /// Message-rate window in seconds.
    pub rate_window_secs: u64,
    /// Recent crossings kept in memory.
    pub max_recent_crossings: usize,
}

/// Checkpoint notification configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Notify for every vehicle.
    pub show_all: bool,
    /// Vehicles to notify for.
    pub watch: Vec<String>,
    /// Selected vehicle.
    pub selected: Option<String>,
    /// Processed crossing ids that trigger a trim.
    pub seen_limit: usize,
    /// Processed crossing ids kept after a trim.
    pub seen_trim_to: usize,
}

/// Data freshness thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Data younger than this is fresh.
    pub fresh_secs: u64,
    /// Data younger than this (and not fresh) is stale.
    pub stale_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            token: None,
            request_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// REST request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: u64::try_from(DEFAULT_BATCH_INTERVAL.as_millis()).unwrap_or(100),
            backoff_schedule_ms: DEFAULT_BACKOFF_SCHEDULE_MS.to_vec(),
            degraded_after: DEFAULT_DEGRADED_AFTER,
            rate_window_secs: DEFAULT_RATE_WINDOW.as_secs(),
            max_recent_crossings: DEFAULT_MAX_RECENT_CROSSINGS,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            show_all: false,
            watch: Vec::new(),
            selected: None,
            seen_limit: DEFAULT_SEEN_LIMIT,
            seen_trim_to: DEFAULT_SEEN_TRIM_TO,
        }
    }
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        let thresholds = FreshnessThresholds::default();
        Self {
            fresh_secs: thresholds.fresh.as_secs(),
            stale_secs: thresholds.stale.as_secs(),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `RACESTREAM_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Config::default()))
                .merge(Toml::file(&config_file))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Extract and validate a configuration from a prepared figment.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if reqwest::Url::parse(&self.server.base_url).is_err() {
            return Err(Error::config_validation(format!(
                "server.base_url is not a valid URL: {}",
                self.server.base_url
            )));
        }

        let stream = &self.stream;
        if stream.batch_interval_ms == 0 {
            return Err(Error::config_validation(
                "stream.batch_interval_ms must be greater than 0",
            ));
        }
        if stream.backoff_schedule_ms.is_empty() {
            return Err(Error::config_validation(
                "stream.backoff_schedule_ms must not be empty",
            ));
        }
        if stream.backoff_schedule_ms.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::config_validation(
                "stream.backoff_schedule_ms must not decrease",
            ));
        }
        if stream.degraded_after == 0 {
            return Err(Error::config_validation(
                "stream.degraded_after must be greater than 0",
            ));
        }
        if stream.rate_window_secs == 0 {
            return Err(Error::config_validation(
                "stream.rate_window_secs must be greater than 0",
            ));
        }

        let notifications = &self.notifications;
        if notifications.seen_trim_to >= notifications.seen_limit {
            return Err(Error::config_validation(format!(
                "notifications.seen_trim_to ({}) must be less than seen_limit ({})",
                notifications.seen_trim_to, notifications.seen_limit
            )));
        }

        if self.freshness.fresh_secs >= self.freshness.stale_secs {
            return Err(Error::config_validation(format!(
                "freshness.fresh_secs ({}) must be less than stale_secs ({})",
                self.freshness.fresh_secs, self.freshness.stale_secs
            )));
        }

        Ok(())
    }

    /// Freshness thresholds as durations.
    #[must_use]
    pub fn freshness_thresholds(&self) -> FreshnessThresholds {
        FreshnessThresholds {
            fresh: Duration::from_secs(self.freshness.fresh_secs),
            stale: Duration::from_secs(self.freshness.stale_secs),
        }
    }

    /// Notification interest.
    #[must_use]
    pub fn interest(&self) -> Interest {
        Interest {
            show_all: self.notifications.show_all,
            watched: self.notifications.watch.iter().cloned().collect(),
            selected: self.notifications.selected.clone(),
        }
    }

    /// Session tunables derived from this configuration.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            batch_interval: Duration::from_millis(self.stream.batch_interval_ms),
            backoff_schedule_ms: self.stream.backoff_schedule_ms.clone(),
            degraded_after: self.stream.degraded_after,
            rate_window: Duration::from_secs(self.stream.rate_window_secs),
            max_recent_crossings: self.stream.max_recent_crossings,
            interest: self.interest(),
            seen_limit: self.notifications.seen_limit,
            seen_trim_to: self.notifications.seen_trim_to,
            freshness: self.freshness_thresholds(),
        }
    }
}
