//! Process-wide limiter configuration.
//!
//! Immutable once built. Invalid constants are rejected by [`LimiterConfigBuilder::build`], so a
//! process that starts serving always has a usable configuration.
//!
//! ```rust
//! use std::time::Duration;
//! use bucketgate::{LimiterConfig, StrategyKind};
//!
//! let config = LimiterConfig::builder()
//!     .bucket_size(210)
//!     .refill_rate(10.0)
//!     .max_retries(3)
//!     .retry_delay(Duration::from_millis(100))
//!     .strategy(StrategyKind::Atomic)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.limits().retry_after_secs(), 1);
//! ```

use std::time::Duration;

use crate::engine::BucketLimits;
use crate::error::ConfigError;
use crate::strategies::StrategyKind;

pub const DEFAULT_BUCKET_SIZE: u64 = 210;
pub const DEFAULT_REFILL_RATE: f64 = 10.0;
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Validated limiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    bucket_size: u64,
    refill_rate: f64,
    max_retries: usize,
    retry_delay: Duration,
    strategy: StrategyKind,
    admission_timeout: Option<Duration>,
}

impl LimiterConfig {
    /// Construct a new builder with defaults.
    pub fn builder() -> LimiterConfigBuilder {
        LimiterConfigBuilder::new()
    }

    pub fn bucket_size(&self) -> u64 {
        self.bucket_size
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn admission_timeout(&self) -> Option<Duration> {
        self.admission_timeout
    }

    pub fn limits(&self) -> BucketLimits {
        BucketLimits::new(self.bucket_size, self.refill_rate)
    }

    /// Upper bound on latency added by retries: `max_retries * retry_delay`.
    pub fn max_retry_latency(&self) -> Duration {
        self.retry_delay.saturating_mul(u32::try_from(self.max_retries).unwrap_or(u32::MAX))
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            refill_rate: DEFAULT_REFILL_RATE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            strategy: StrategyKind::default(),
            admission_timeout: None,
        }
    }
}

/// Builder for [`LimiterConfig`].
#[derive(Debug, Clone)]
pub struct LimiterConfigBuilder {
    config: LimiterConfig,
}

impl LimiterConfigBuilder {
    pub fn new() -> Self {
        Self { config: LimiterConfig::default() }
    }

    /// Maximum burst capacity. Must be > 0.
    pub fn bucket_size(mut self, bucket_size: u64) -> Self {
        self.config.bucket_size = bucket_size;
        self
    }

    /// Tokens added per second. Must be finite and > 0.
    pub fn refill_rate(mut self, refill_rate: f64) -> Self {
        self.config.refill_rate = refill_rate;
        self
    }

    /// Retries after the initial attempt. `0` disables retrying.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Fixed wait between attempts.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.config.retry_delay = retry_delay;
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Deadline for the whole evaluate-and-retry sequence of one request.
    pub fn admission_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.admission_timeout = timeout;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<LimiterConfig, ConfigError> {
        let config = self.config;
        if config.bucket_size == 0 {
            return Err(ConfigError::ZeroBucketSize);
        }
        if !config.refill_rate.is_finite() || config.refill_rate <= 0.0 {
            return Err(ConfigError::InvalidRefillRate(config.refill_rate));
        }
        if config.admission_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroAdmissionTimeout);
        }
        Ok(config)
    }
}

impl Default for LimiterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
