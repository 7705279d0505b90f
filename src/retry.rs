//! Bounded retry around an admission strategy.
//!
//! Semantics:
//! - The strategy decides which outcomes are transient ([`AdmissionStrategy::is_transient`]):
//!   contention for the atomic strategy, an empty bucket for the optimistic one.
//! - A transient outcome is retried while `retries < max_retries`, after a fixed `retry_delay`.
//!   Each attempt re-reads the clock.
//! - Once the budget is spent, the last outcome is final. A final contention becomes a
//!   rejection carrying the last `retry_after` the store reported, which may understate the real
//!   wait when the bucket was never empty.
//! - Store errors are returned at once and never retried.
//!
//! Invariants:
//! - At most `max_retries + 1` strategy invocations per call.
//! - Added latency is at most `max_retries * retry_delay` plus store round-trips.
//! - Dropping the returned future stops the loop at its next await; no further attempt runs.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::decision::{Admission, Attempt};
use crate::error::StoreError;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::strategies::AdmissionStrategy;
use crate::telemetry::{emit_best_effort, LimiterEvent, NullSink, RetryReason, TelemetrySink};

/// Runs an [`AdmissionStrategy`] with a fixed-backoff retry budget.
#[derive(Clone)]
pub struct RetryController<T = NullSink> {
    strategy: Arc<dyn AdmissionStrategy>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    max_retries: usize,
    retry_delay: Duration,
    sink: T,
}

impl<T> std::fmt::Debug for RetryController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("strategy", &self.strategy)
            .field("clock", &self.clock)
            .field("sleeper", &self.sleeper)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("sink", &"<sink>")
            .finish()
    }
}

impl RetryController<NullSink> {
    /// Controller with the system clock, tokio sleeps and no telemetry.
    pub fn new(strategy: Arc<dyn AdmissionStrategy>, max_retries: usize, retry_delay: Duration) -> Self {
        Self {
            strategy,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            max_retries,
            retry_delay,
            sink: NullSink,
        }
    }

    /// Controller using the retry budget from `config`.
    pub fn from_config(strategy: Arc<dyn AdmissionStrategy>, config: &LimiterConfig) -> Self {
        Self::new(strategy, config.max_retries(), config.retry_delay())
    }
}

impl<T: TelemetrySink> RetryController<T> {
    /// Replace the clock, e.g. with a [`ManualClock`](crate::clock::ManualClock) in tests.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Route limiter events to `sink`.
    pub fn with_sink<U: TelemetrySink>(self, sink: U) -> RetryController<U> {
        RetryController {
            strategy: self.strategy,
            clock: self.clock,
            sleeper: self.sleeper,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            sink,
        }
    }

    pub fn strategy(&self) -> &Arc<dyn AdmissionStrategy> {
        &self.strategy
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn sink(&self) -> &T {
        &self.sink
    }

    /// Decide whether one request for `key` is admitted.
    pub async fn admit(&self, key: &str) -> Result<Admission, StoreError> {
        let limit = self.strategy.limits().bucket_size;
        let mut retries = 0usize;

        loop {
            let now_ms = self.clock.now_millis();
            let attempt = match self.strategy.attempt(key, now_ms).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    warn!(key, error = %e, strategy = %self.strategy.kind(), "bucket store failure");
                    emit_best_effort(
                        &self.sink,
                        LimiterEvent::StoreFailure { key: key.to_string(), error: e.to_string() },
                    )
                    .await;
                    return Err(e);
                }
            };

            if self.strategy.is_transient(&attempt) {
                let reason = match attempt {
                    Attempt::Contended { .. } => RetryReason::Contention,
                    _ => RetryReason::Exhausted,
                };
                if retries < self.max_retries {
                    retries += 1;
                    debug!(key, retry = retries, %reason, "scheduling admission retry");
                    emit_best_effort(
                        &self.sink,
                        LimiterEvent::RetryScheduled {
                            key: key.to_string(),
                            retry: retries,
                            delay: self.retry_delay,
                            reason,
                        },
                    )
                    .await;
                    self.sleeper.sleep(self.retry_delay).await;
                    continue;
                }
                if self.max_retries > 0 {
                    emit_best_effort(
                        &self.sink,
                        LimiterEvent::RetriesExhausted { key: key.to_string(), retries, reason },
                    )
                    .await;
                }
            }

            let admission = Admission::from_attempt(attempt, limit, now_ms, retries);
            let event = if admission.admitted {
                LimiterEvent::Admitted { key: key.to_string(), remaining: admission.remaining }
            } else {
                LimiterEvent::Rejected {
                    key: key.to_string(),
                    retry_after_secs: admission.retry_after_secs,
                }
            };
            emit_best_effort(&self.sink, event).await;
            return Ok(admission);
        }
    }
}
