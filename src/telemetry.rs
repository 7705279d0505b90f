//! Telemetry for the limiter.
//!
//! The retry controller emits structured [`LimiterEvent`]s describing every decision. Events flow
//! through a [`TelemetrySink`], which is a `tower::Service<LimiterEvent>` so sinks compose with
//! ordinary tower tooling.
//!
//! ```rust
//! use bucketgate::telemetry::{LimiterEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = LimiterEvent::Rejected { key: "ratelimit:10.0.0.1".into(), retry_after_secs: 1 };
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Boxed future returned by every sink.
pub type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A telemetry sink that consumes limiter events.
pub trait TelemetrySink:
    Service<LimiterEvent, Response = (), Error = Self::SinkError, Future = SinkFuture<Self::SinkError>>
    + Clone
    + Send
    + Sync
    + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Admission must never wait on telemetry: an unready or failing sink drops the event.
pub async fn emit_best_effort<S: TelemetrySink>(sink: &S, event: LimiterEvent) {
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.clone().ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Why a retry was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The store reported a concurrent conflict.
    Contention,
    /// The bucket was empty at read time.
    Exhausted,
}

/// Events emitted while admitting a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// A token was taken.
    Admitted { key: String, remaining: u64 },
    /// The request was turned away.
    Rejected { key: String, retry_after_secs: u64 },
    /// A transient outcome will be retried after `delay`.
    RetryScheduled { key: String, retry: usize, delay: Duration, reason: RetryReason },
    /// The retry budget ran out on a transient outcome.
    RetriesExhausted { key: String, retries: usize, reason: RetryReason },
    /// The store failed; the request is failed closed.
    StoreFailure { key: String, error: String },
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Contention => write!(f, "contention"),
            RetryReason::Exhausted => write!(f, "exhausted"),
        }
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Admitted { key, remaining } => {
                write!(f, "Admitted({}, remaining={})", key, remaining)
            }
            LimiterEvent::Rejected { key, retry_after_secs } => {
                write!(f, "Rejected({}, retry_after={}s)", key, retry_after_secs)
            }
            LimiterEvent::RetryScheduled { key, retry, delay, reason } => {
                write!(f, "RetryScheduled({}, #{}, delay={:?}, {})", key, retry, delay, reason)
            }
            LimiterEvent::RetriesExhausted { key, retries, reason } => {
                write!(f, "RetriesExhausted({}, retries={}, {})", key, retries, reason)
            }
            LimiterEvent::StoreFailure { key, error } => {
                write!(f, "StoreFailure({}, {})", key, error)
            }
        }
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Exhausted retry budgets log at WARN. Store failures, retries and rejections log at DEBUG
/// (the retry controller already warns on store failures), admissions at TRACE.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        match &event {
            LimiterEvent::RetriesExhausted { .. } => tracing::warn!(event = %event, "limiter_event"),
            LimiterEvent::StoreFailure { .. }
            | LimiterEvent::Rejected { .. }
            | LimiterEvent::RetryScheduled { .. } => {
                tracing::debug!(event = %event, "limiter_event")
            }
            LimiterEvent::Admitted { .. } => tracing::trace!(event = %event, "limiter_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Bounded; the oldest events are evicted once `capacity` is reached.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LimiterEvent>>>,
    capacity: usize,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: Arc::new(Mutex::new(Vec::new())), capacity: capacity.max(1) }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
