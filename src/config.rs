//! Configuration management for tollgate.
//!
//! Values are layered, later sources winning:
//! 1. Built-in defaults
//! 2. A YAML file (optional)
//! 3. Environment variables prefixed `TOLLGATE__`, with `__` between
//!    section and field, e.g. `TOLLGATE__STORE__BACKEND=redis`

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    validate_max_idle, FailurePolicy, RateLimitConfig, RedisStoreOptions, DEFAULT_KEY_PREFIX,
    DEFAULT_MAX_RETRIES,
};

const ENV_PREFIX: &str = "TOLLGATE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for a tollgate deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Bucket parameters
    #[serde(default = "default_bucket")]
    pub bucket: RateLimitConfig,

    /// Backend selection and tuning
    #[serde(default)]
    pub store: StoreConfig,

    /// Handling of store failures during traffic
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            store: StoreConfig::default(),
            failure_policy: FailurePolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_bucket() -> RateLimitConfig {
    RateLimitConfig::new(default_capacity(), default_refill_rate())
        .expect("built-in bucket defaults are valid")
}

fn default_capacity() -> f64 {
    5.0
}

fn default_refill_rate() -> f64 {
    1.0
}

/// Which store holds bucket state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process map; state is per instance
    #[default]
    Local,
    /// Redis-compatible server shared by every instance
    Redis,
}

impl std::str::FromStr for Backend {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" | "memory" => Ok(Backend::Local),
            "redis" => Ok(Backend::Redis),
            _ => Err(TollgateError::Config(format!(
                "Invalid backend: {}. Valid options are: local, redis",
                s
            ))),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend chosen at startup
    #[serde(default)]
    pub backend: Backend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace for remote keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Remote entry expiry in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Bound on each remote call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries after a busy reply from Redis
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Use the local store if Redis is unreachable at startup
    #[serde(default)]
    pub fallback_to_local: bool,

    /// Evict local buckets idle for this many seconds
    #[serde(default)]
    pub local_max_idle_secs: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            fallback_to_local: false,
            local_max_idle_secs: None,
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl StoreConfig {
    /// Idle window for local bucket eviction, if enabled.
    pub fn local_max_idle(&self) -> Option<Duration> {
        self.local_max_idle_secs.map(Duration::from_secs)
    }

    /// Options for a [`RedisStore`](crate::ratelimit::RedisStore).
    pub fn redis_options(&self) -> RedisStoreOptions {
        RedisStoreOptions {
            key_prefix: self.key_prefix.clone(),
            ttl: Duration::from_secs(self.ttl_secs),
            timeout: Duration::from_millis(self.timeout_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional YAML file and `TOLLGATE__*` environment variables
    /// over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check constraints spanning more than one section.
    pub fn validate(&self) -> Result<()> {
        if let Some(max_idle) = self.store.local_max_idle() {
            validate_max_idle(max_idle, &self.bucket)?;
        }
        Ok(())
    }
}
