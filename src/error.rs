//! Error types for the limiter
//!
//! Three families, matching the boundaries they cross:
//! - [`StoreError`]: anything that went wrong talking to the shared bucket store. Never retried.
//! - [`ConfigError`]: invalid constants, rejected by [`LimiterConfigBuilder::build`] before any
//!   request is served.
//! - [`LimiterError`]: what the middleware receives when no admission decision could be made.
//!
//! [`LimiterConfigBuilder::build`]: crate::config::LimiterConfigBuilder::build
use std::time::Duration;

/// Failure while reading or mutating bucket state in the shared store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (connection refused, dropped, I/O failure).
    #[error("bucket store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer in time.
    #[error("bucket store timed out after {0:?}")]
    Timeout(Duration),
    /// The store answered with something that cannot be bucket state.
    #[error("malformed bucket store reply: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Shorthand for [`StoreError::Unavailable`].
    pub fn unavailable(msg: impl Into<String>) -> Self {
        StoreError::Unavailable(msg.into())
    }

    /// Shorthand for [`StoreError::Malformed`].
    pub fn malformed(msg: impl Into<String>) -> Self {
        StoreError::Malformed(msg.into())
    }
}

/// Invalid limiter configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `bucket_size` must be > 0.
    #[error("bucket_size must be > 0")]
    ZeroBucketSize,
    /// `refill_rate` must be finite and > 0.
    #[error("refill_rate must be finite and > 0 (got {0})")]
    InvalidRefillRate(f64),
    /// `admission_timeout`, when set, must be > 0.
    #[error("admission_timeout must be > 0 when set")]
    ZeroAdmissionTimeout,
    /// Unknown strategy name.
    #[error("unknown admission strategy `{0}` (expected `atomic` or `optimistic`)")]
    UnknownStrategy(String),
}

/// No admission decision could be produced for a request.
///
/// The middleware maps every variant to `500 Internal Server Error` and never forwards.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LimiterError {
    /// The store failed during evaluation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The evaluate-and-retry sequence exceeded the configured admission timeout.
    #[error("admission timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

impl LimiterError {
    /// Check if this error is due to the admission timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Borrow the store error, if that is what this is.
    pub fn as_store(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}
