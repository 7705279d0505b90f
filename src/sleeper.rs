//! The wait between admission retries.
//!
//! [`RetryController`](crate::retry::RetryController) never calls `tokio::time::sleep`
//! directly; it goes through a [`Sleeper`] so tests can count or skip retry delays.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Boxed wait future handed back to the retry loop.
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Waits out one retry delay.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    /// Resolve after `delay`. Dropping the future abandons the retry.
    fn sleep(&self, delay: Duration) -> SleepFuture;
}

/// Timer-backed delay on the tokio runtime. Used outside tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, delay: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(delay))
    }
}

/// Resolves at once; retries run back to back.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _delay: Duration) -> SleepFuture {
        Box::pin(std::future::ready(()))
    }
}

/// Records each requested retry delay and resolves at once.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded waits, oldest first.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sum of all recorded waits.
    pub fn total(&self) -> Duration {
        self.calls().iter().sum()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, delay: Duration) -> SleepFuture {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(delay);
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETRY_DELAY: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn instant_sleeper_skips_the_retry_delay() {
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            InstantSleeper.sleep(RETRY_DELAY).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn tracking_sleeper_sums_a_retry_budget() {
        let sleeper = TrackingSleeper::new();
        for _ in 0..3 {
            sleeper.sleep(RETRY_DELAY).await;
        }

        assert_eq!(sleeper.calls().len(), 3);
        assert_eq!(sleeper.total(), RETRY_DELAY * 3);

        sleeper.clear();
        assert_eq!(sleeper.total(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_waits_exactly_the_delay() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(RETRY_DELAY).await;
        assert_eq!(start.elapsed(), RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_wait_cancels_it() {
        let wait = TokioSleeper.sleep(Duration::from_secs(60));
        let outcome = tokio::time::timeout(RETRY_DELAY, wait).await;
        assert!(outcome.is_err());
    }
}
