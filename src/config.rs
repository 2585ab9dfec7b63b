use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const APP_NAME: &str = "sadako";
const CONFIG_FILE: &str = "sadako.json";

const DEFAULT_LEASE_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_TICK_SECS: u64 = 60;
const SECS_PER_DAY: u64 = 24 * 60 * 60;
/// Longest lease accepted: one hundred years.
pub const MAX_LEASE_SECS: u64 = 100 * 365 * SECS_PER_DAY;

/// A lease timing setting the engine cannot run with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("lease.duration_secs must be greater than zero")]
    ZeroDuration,

    #[error("lease.duration_secs is {secs}, at most {max} allowed")]
    DurationTooLong { secs: u64, max: u64 },

    #[error("lease.tick_interval_secs must be greater than zero")]
    ZeroTickInterval,

    #[error("lease.retry.attempts must be at least 1")]
    NoAttempts,
}

/// Service configuration, read once at startup and passed down by value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SadakoConfig {
    pub lease: LeaseConfig,
    pub server: ServerConfig,
    pub messages: Messages,
    /// Where lifecycle messages are posted. No messages are sent when unset.
    pub webhook_url: Option<String>,
    /// SQLite file. Defaults to the platform data directory.
    pub database_path: Option<PathBuf>,
}

/// Timing of the lease engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long a curse lasts.
    pub duration_secs: u64,
    /// Longest gap between two expiration passes.
    pub tick_interval_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: DEFAULT_LEASE_SECS,
            tick_interval_secs: DEFAULT_TICK_SECS,
            retry: RetryPolicy::default(),
        }
    }
}

impl LeaseConfig {
    /// Both durations are rounded up to whole seconds.
    pub fn new(duration: Duration, tick_interval: Duration) -> Result<Self, ConfigError> {
        let config = Self {
            duration_secs: ceil_secs(duration),
            tick_interval_secs: ceil_secs(tick_interval),
            retry: RetryPolicy::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.duration_secs).unwrap_or(i64::MAX))
    }

    /// Lease length in whole days, rounded up.
    pub fn duration_days(&self) -> u32 {
        u32::try_from(self.duration_secs.div_ceil(SECS_PER_DAY)).unwrap_or(u32::MAX)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration_secs == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        if self.duration_secs > MAX_LEASE_SECS {
            return Err(ConfigError::DurationTooLong {
                secs: self.duration_secs,
                max: MAX_LEASE_SECS,
            });
        }
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        Ok(())
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Bounded retry with exponential backoff for store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// A single try, no waiting.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_backoff_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Bearer token for the admin API. Overridden by `SADAKO_API_KEY`.
    pub api_key: Option<String>,
    /// Origins allowed to call the admin API from a browser. Any origin when unset.
    pub cors_origins: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 17020,
            api_key: None,
            cors_origins: None,
        }
    }
}

/// Texts sent to a subject at each lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Messages {
    pub curse: String,
    /// `{days}` is replaced with the lease length in days.
    pub pact: String,
    /// `{days}` is replaced with the days left.
    pub reminder: String,
    pub eliminate: String,
    pub atone: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            curse: "<https://youtu.be/Gw492Uz-EVg>".to_string(),
            pact: "{days} days".to_string(),
            reminder: "{days} days".to_string(),
            eliminate: "<https://youtu.be/c80-nyjP9Hg>".to_string(),
            atone: "<https://youtu.be/5OlSgtKB37s>".to_string(),
        }
    }
}

impl SadakoConfig {
    /// Load configuration from `path`, or from the user's config directory.
    /// Returns defaults if the file doesn't exist or fails to parse.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = match Self::try_load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config, using defaults: {:#}", e);
                Self::default()
            }
        };
        config.apply_env();
        config
    }

    pub fn try_load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => get_config_path()?,
        };
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).context("Failed to parse config file")?;
        config.lease.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("SADAKO_API_KEY") {
            self.server.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("SADAKO_WEBHOOK_URL") {
            self.webhook_url = Some(url);
        }
    }

    /// Save the current configuration to `path`, or the user's config directory.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => get_config_path()?,
        };

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }
}

fn get_config_path() -> Result<PathBuf> {
    let mut path =
        config_dir().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    path.push(APP_NAME);
    path.push(CONFIG_FILE);
    Ok(path)
}
