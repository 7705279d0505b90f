//! Admission strategies: how engine arithmetic meets the store.
//!
//! Both variants share [`crate::engine`] and differ only in store access pattern and in which
//! outcomes they treat as transient:
//!
//! | strategy                 | store contract        | transient outcome | lost updates |
//! |--------------------------|-----------------------|-------------------|--------------|
//! | [`AtomicScriptStrategy`] | [`AtomicBucketStore`] | `Contended`       | impossible   |
//! | [`OptimisticStrategy`]   | [`BucketStore`]       | `Exhausted`       | accepted     |
//!
//! The optimistic race is deliberate: two requests that read the same state both admit and the
//! second write overwrites the first. Retrying does not detect it. Prefer the atomic strategy
//! whenever the store can run it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::decision::Attempt;
use crate::engine::{evaluate, BucketLimits, BucketState};
use crate::error::{ConfigError, StoreError};
use crate::store::{AtomicBucketStore, BucketStore, REMAINING_CONTENDED, REMAINING_EXHAUSTED};

/// One way of evaluating a request against the shared bucket.
#[async_trait]
pub trait AdmissionStrategy: Send + Sync + fmt::Debug {
    /// Evaluate one request for `key` at `now_ms`.
    async fn attempt(&self, key: &str, now_ms: u64) -> Result<Attempt, StoreError>;

    /// Whether `attempt` may resolve differently if tried again after a short wait.
    fn is_transient(&self, attempt: &Attempt) -> bool;

    fn limits(&self) -> &BucketLimits;

    fn kind(&self) -> StrategyKind;
}

/// Strategy selector, as read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    #[serde(alias = "script", alias = "lua")]
    Atomic,
    #[serde(alias = "rmw")]
    Optimistic,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Atomic => "atomic",
            StrategyKind::Optimistic => "optimistic",
        }
    }

    /// Build the selected strategy over a store that supports both contracts.
    pub fn build<S>(self, store: Arc<S>, limits: BucketLimits) -> Arc<dyn AdmissionStrategy>
    where
        S: BucketStore + AtomicBucketStore + fmt::Debug + 'static,
    {
        match self {
            StrategyKind::Atomic => Arc::new(AtomicScriptStrategy::new(store, limits)),
            StrategyKind::Optimistic => Arc::new(OptimisticStrategy::new(store, limits)),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "atomic" | "script" | "lua" => Ok(StrategyKind::Atomic),
            "optimistic" | "rmw" => Ok(StrategyKind::Optimistic),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Delegates the whole read-evaluate-write to the store as one atomic operation.
#[derive(Debug)]
pub struct AtomicScriptStrategy<S> {
    store: Arc<S>,
    limits: BucketLimits,
}

impl<S> AtomicScriptStrategy<S>
where
    S: AtomicBucketStore + 'static,
{
    pub fn new(store: Arc<S>, limits: BucketLimits) -> Self {
        Self { store, limits }
    }
}

#[async_trait]
impl<S> AdmissionStrategy for AtomicScriptStrategy<S>
where
    S: AtomicBucketStore + fmt::Debug + 'static,
{
    async fn attempt(&self, key: &str, now_ms: u64) -> Result<Attempt, StoreError> {
        let reply = self.store.check_and_decrement(key, now_ms, &self.limits).await?;
        trace!(key, remaining = reply.remaining, retry_after = reply.retry_after_secs, "atomic reply");

        match reply.remaining {
            r if r >= 0 => Ok(Attempt::Admitted {
                remaining: r as u64,
                retry_after_secs: reply.retry_after_secs,
            }),
            REMAINING_EXHAUSTED => Ok(Attempt::Exhausted { retry_after_secs: reply.retry_after_secs }),
            REMAINING_CONTENDED => {
                debug!(key, "store reported contention");
                Ok(Attempt::Contended { retry_after_secs: reply.retry_after_secs })
            }
            other => Err(StoreError::malformed(format!("unexpected remaining value {other}"))),
        }
    }

    fn is_transient(&self, attempt: &Attempt) -> bool {
        matches!(attempt, Attempt::Contended { .. })
    }

    fn limits(&self) -> &BucketLimits {
        &self.limits
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Atomic
    }
}

/// Reads state, evaluates in-process, writes the result back unconditionally.
///
/// Concurrent requests for one key can both read the same state and both admit. This
/// over-admission is not detected and not retried; only an empty bucket is treated as
/// transient.
#[derive(Debug)]
pub struct OptimisticStrategy<S> {
    store: Arc<S>,
    limits: BucketLimits,
}

impl<S> OptimisticStrategy<S>
where
    S: BucketStore + 'static,
{
    pub fn new(store: Arc<S>, limits: BucketLimits) -> Self {
        Self { store, limits }
    }
}

#[async_trait]
impl<S> AdmissionStrategy for OptimisticStrategy<S>
where
    S: BucketStore + fmt::Debug + 'static,
{
    async fn attempt(&self, key: &str, now_ms: u64) -> Result<Attempt, StoreError> {
        let current = self
            .store
            .get_bucket(key)
            .await?
            .unwrap_or_else(|| BucketState::full(&self.limits, now_ms));

        let eval = evaluate(current, now_ms, &self.limits);
        trace!(key, tokens = current.tokens, admitted = eval.admitted, "optimistic evaluation");

        if !eval.admitted {
            // Nothing to persist: writing an empty bucket would only advance the refill clock.
            return Ok(Attempt::Exhausted { retry_after_secs: eval.retry_after_secs });
        }

        self.store.set_bucket(key, eval.state).await?;
        Ok(Attempt::Admitted { remaining: eval.state.tokens, retry_after_secs: eval.retry_after_secs })
    }

    fn is_transient(&self, attempt: &Attempt) -> bool {
        matches!(attempt, Attempt::Exhausted { .. })
    }

    fn limits(&self) -> &BucketLimits {
        &self.limits
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Optimistic
    }
}
