//! Token bucket arithmetic.
//!
//! [`evaluate`] is the only place refill and decrement are computed. It never touches storage:
//! strategies read state, hand it here, and decide what to persist.
//!
//! ```rust
//! use bucketgate::engine::{evaluate, BucketLimits, BucketState};
//!
//! let limits = BucketLimits::new(210, 10.0);
//! // Empty bucket, last refilled 500ms ago: 5 tokens come back, one is spent.
//! let eval = evaluate(BucketState::new(0, 1_000), 1_500, &limits);
//! assert!(eval.admitted);
//! assert_eq!(eval.state.tokens, 4);
//! ```

/// Bucket dimensions shared by every key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    /// Maximum burst capacity.
    pub bucket_size: u64,
    /// Tokens added per second.
    pub refill_rate: f64,
}

impl BucketLimits {
    pub fn new(bucket_size: u64, refill_rate: f64) -> Self {
        Self { bucket_size, refill_rate }
    }

    /// Seconds until at least one token is guaranteed to be available again: `ceil(1 / rate)`.
    pub fn retry_after_secs(&self) -> u64 {
        (1.0 / self.refill_rate).ceil() as u64
    }
}

/// Persisted per-key bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens: u64,
    /// Epoch milliseconds of the last refill.
    pub last_refill_ms: u64,
}

impl BucketState {
    pub fn new(tokens: u64, last_refill_ms: u64) -> Self {
        Self { tokens, last_refill_ms }
    }

    /// State of a key seen for the first time.
    pub fn full(limits: &BucketLimits, now_ms: u64) -> Self {
        Self { tokens: limits.bucket_size, last_refill_ms: now_ms }
    }
}

/// Result of one [`evaluate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// State after refill and, when admitted, after the decrement.
    pub state: BucketState,
    pub admitted: bool,
    /// `0` when admitted.
    pub retry_after_secs: u64,
}

/// Refill `state` up to `now_ms` and try to take one token.
///
/// Invariants:
/// - `0 <= state.tokens <= bucket_size` on output, whatever the input.
/// - `state.last_refill_ms` never moves backwards. A `now_ms` older than the stored timestamp
///   (clock skew between processes) counts as zero elapsed time.
pub fn evaluate(state: BucketState, now_ms: u64, limits: &BucketLimits) -> Evaluation {
    let elapsed_ms = now_ms.saturating_sub(state.last_refill_ms);
    let refill = (elapsed_ms as f64 * limits.refill_rate / 1000.0).floor() as u64;
    let tokens = state.tokens.saturating_add(refill).min(limits.bucket_size);
    let last_refill_ms = now_ms.max(state.last_refill_ms);

    if tokens > 0 {
        Evaluation {
            state: BucketState { tokens: tokens - 1, last_refill_ms },
            admitted: true,
            retry_after_secs: 0,
        }
    } else {
        Evaluation {
            state: BucketState { tokens: 0, last_refill_ms },
            admitted: false,
            retry_after_secs: limits.retry_after_secs(),
        }
    }
}
