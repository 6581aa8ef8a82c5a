//! Daemon configuration.
//!
//! Everything is fixed at startup. Sources, lowest precedence first:
//! built-in defaults, an optional TOML file, the `HIT_SOCKET` environment
//! variable, then command-line flags (applied by the binary).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::breaker::BreakerConfig;
use crate::handler::FanOut;
use crate::keeper::KeeperConfig;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/hitd.sock";

/// Environment variable overriding the socket path
pub const SOCKET_ENV: &str = "HIT_SOCKET";

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HitConfig {
    pub socket_path: PathBuf,

    /// How count updates reach the breaker
    pub fan_out: FanOut,

    /// Text on the left half of rendered badges
    pub badge_label: String,

    pub keeper: KeeperConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub limiter: LimiterConfig,
}

impl Default for HitConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            fan_out: FanOut::default(),
            badge_label: "hits".to_string(),
            keeper: KeeperConfig::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            limiter: LimiterConfig::default(),
        }
    }
}

/// Local count cache used by badge rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "ttl_ms", with = "millis")]
    pub ttl: Duration,

    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Per-visitor admission for the in-process limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Visits admitted per key per window
    pub quota: u32,

    #[serde(rename = "window_ms", with = "millis")]
    pub window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            quota: 30,
            window: Duration::from_secs(60),
        }
    }
}

impl HitConfig {
    /// Loads the configuration.
    ///
    /// Reads `path` if given (a missing file is an error), then applies the
    /// environment override and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Applies environment overrides, looking variables up with `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup(SOCKET_ENV).filter(|s| !s.is_empty()) {
            debug!(socket = %socket, "Socket path overridden from environment");
            self.socket_path = PathBuf::from(socket);
        }
    }

    /// Rejects zero capacities, worker counts and timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.keeper
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.breaker
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket_path must not be empty".to_string()));
        }
        if self.cache.ttl.is_zero() || self.cache.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "cache ttl and sweep interval must be greater than zero".to_string(),
            ));
        }
        if self.limiter.quota == 0 || self.limiter.window.is_zero() {
            return Err(ConfigError::Invalid(
                "limiter quota and window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper storing a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
