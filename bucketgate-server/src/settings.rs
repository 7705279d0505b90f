//! Server settings, loaded from YAML and overridden by CLI flags.

use anyhow::Context;
use bucketgate::config::{
    DEFAULT_BUCKET_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_REFILL_RATE, DEFAULT_RETRY_DELAY,
};
use bucketgate::{ConfigError, LimiterConfig, StrategyKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub limiter: LimiterSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the HTTP listener binds.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Key clients on the first `X-Forwarded-For` hop. Only enable behind a trusted proxy.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { listen: default_listen(), trust_forwarded_for: false }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Limiter constants; validated by [`Settings::limiter_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default = "default_bucket_size")]
    pub bucket_size: u64,

    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub strategy: StrategyKind,

    /// Deadline for one request's evaluation, retries included.
    #[serde(default)]
    pub admission_timeout_ms: Option<u64>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            bucket_size: default_bucket_size(),
            refill_rate: default_refill_rate(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            strategy: StrategyKind::default(),
            admission_timeout_ms: None,
        }
    }
}

fn default_bucket_size() -> u64 {
    DEFAULT_BUCKET_SIZE
}

fn default_refill_rate() -> f64 {
    DEFAULT_REFILL_RATE
}

fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY.as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process-local buckets; only correct for a single instance.
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { backend: Backend::default(), redis_url: default_redis_url() }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Settings {
    /// Load settings from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        Self::from_yaml(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Validate the limiter section into a [`LimiterConfig`].
    pub fn limiter_config(&self) -> Result<LimiterConfig, ConfigError> {
        let limiter = &self.limiter;
        LimiterConfig::builder()
            .bucket_size(limiter.bucket_size)
            .refill_rate(limiter.refill_rate)
            .max_retries(limiter.max_retries)
            .retry_delay(Duration::from_millis(limiter.retry_delay_ms))
            .strategy(limiter.strategy)
            .admission_timeout(limiter.admission_timeout_ms.map(Duration::from_millis))
            .build()
    }
}
