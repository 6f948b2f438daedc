//! Configuration model and layered loading.
//!
//! Merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. `./fitswap.toml` (or an explicit path)
//! 3. `FITSWAP_*` environment variables, e.g. `FITSWAP_WATCH_GRACE_MS` or
//!    `FITSWAP_RETRY_POLICIES_PROCESSOR_MAX_ATTEMPTS`

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicies;
use crate::store::QuotaDefaults;

const ENV_PREFIX: &str = "FITSWAP_";
const ENV_SECTIONS: [&str; 5] = ["logging", "rate_limit", "quota", "watch", "worker"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(value: figment::Error) -> Self {
        ConfigError::Load(Box::new(value))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FitswapConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub quota: QuotaDefaults,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryPolicies,
}

impl FitswapConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.validate()?;
        self.watch.validate()?;
        self.worker.validate()?;
        self.retry.validate().map_err(ConfigError::Invalid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// JSON lines when true, human-readable text otherwise.
    #[serde(default = "default_true")]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_max_requests() -> u32 {
    10
}

fn default_window_ms() -> u64 {
    60_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_ms == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Bounds for long-poll watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_min_poll_ms")]
    pub min_poll_ms: u64,
    #[serde(default = "default_max_poll_ms")]
    pub max_poll_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub default_poll_ms: u64,
    /// Budget for the final read after the deadline.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_max_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_min_poll_ms() -> u64 {
    10
}

fn default_max_poll_ms() -> u64 {
    10_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_poll_ms() -> u64 {
    500
}

fn default_grace_ms() -> u64 {
    2_000
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_timeout_ms: default_max_timeout_ms(),
            min_poll_ms: default_min_poll_ms(),
            max_poll_ms: default_max_poll_ms(),
            default_timeout_ms: default_timeout_ms(),
            default_poll_ms: default_poll_ms(),
            grace_ms: default_grace_ms(),
        }
    }
}

impl WatchConfig {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn min_poll(&self) -> Duration {
        Duration::from_millis(self.min_poll_ms)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_millis(self.max_poll_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn default_poll(&self) -> Duration {
        Duration::from_millis(self.default_poll_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_poll_ms == 0 || self.min_poll_ms > self.max_poll_ms {
            return Err(ConfigError::Invalid(
                "watch.min_poll_ms must be > 0 and <= watch.max_poll_ms".into(),
            ));
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            return Err(ConfigError::Invalid(
                "watch.default_timeout_ms must be <= watch.max_timeout_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Name for logging
    #[serde(default = "default_worker_name")]
    pub name: String,
    /// Maximum conversions processed at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_worker_name() -> String {
    "conversion-worker".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            max_concurrent: default_max_concurrent(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl WorkerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 || self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_concurrent and worker.queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Load `./fitswap.toml` (if present) with env var overrides.
pub fn load_config() -> Result<FitswapConfig, ConfigError> {
    extract(
        Figment::new()
            .merge(Serialized::defaults(FitswapConfig::default()))
            .merge(Toml::file("fitswap.toml"))
            .merge(env_provider()),
    )
}

/// Load from a TOML string only (no file, no env).
pub fn load_config_from_str(toml_content: &str) -> Result<FitswapConfig, ConfigError> {
    extract(
        Figment::new()
            .merge(Serialized::defaults(FitswapConfig::default()))
            .merge(Toml::string(toml_content)),
    )
}

/// Load from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<FitswapConfig, ConfigError> {
    extract(
        Figment::new()
            .merge(Serialized::defaults(FitswapConfig::default()))
            .merge(Toml::file(path))
            .merge(env_provider()),
    )
}

/// The compiled defaults rendered as TOML, as a starting `fitswap.toml`.
pub fn default_config_toml() -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(&FitswapConfig::default())?)
}

fn extract(figment: Figment) -> Result<FitswapConfig, ConfigError> {
    let config: FitswapConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

fn env_provider() -> Env {
    Env::prefixed(ENV_PREFIX).map(|key| env_key_path(key.as_str()).into())
}

/// Map a prefix-stripped, lowercased env key to a dotted config path.
///
/// `rate_limit_max_requests` maps to `rate_limit.max_requests`. Sections are
/// matched by explicit prefix since both section and key names contain
/// underscores. Retry policies take `retry_default_<field>` and
/// `retry_policies_<class>_<field>`; operation classes cannot contain `_`.
fn env_key_path(key: &str) -> String {
    if let Some(rest) = key.strip_prefix("retry_") {
        if let Some(field) = rest.strip_prefix("default_") {
            return format!("retry.default.{field}");
        }
        if let Some((class, field)) = rest
            .strip_prefix("policies_")
            .and_then(|policy| policy.split_once('_'))
        {
            return format!("retry.policies.{class}.{field}");
        }
    }
    ENV_SECTIONS
        .iter()
        .find_map(|section| {
            key.strip_prefix(section)
                .and_then(|rest| rest.strip_prefix('_'))
                .map(|rest| format!("{section}.{rest}"))
        })
        .unwrap_or_else(|| key.to_string())
}
