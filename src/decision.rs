//! Admission outcomes.
//!
//! - [`Attempt`]: what one strategy invocation observed. May be transient.
//! - [`Admission`]: the final, immutable verdict handed to the middleware. Only the middleware
//!   turns it into status codes and headers.

/// Outcome of a single [`AdmissionStrategy::attempt`](crate::strategies::AdmissionStrategy::attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// A token was taken.
    Admitted {
        /// Tokens left after this request.
        remaining: u64,
        retry_after_secs: u64,
    },
    /// The bucket had no token to give.
    Exhausted { retry_after_secs: u64 },
    /// The store saw a concurrent conflict and changed nothing.
    Contended { retry_after_secs: u64 },
}

impl Attempt {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Attempt::Admitted { .. })
    }

    pub fn retry_after_secs(&self) -> u64 {
        match *self {
            Attempt::Admitted { retry_after_secs, .. }
            | Attempt::Exhausted { retry_after_secs }
            | Attempt::Contended { retry_after_secs } => retry_after_secs,
        }
    }
}

/// Final admission verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Bucket size, reported as `X-RateLimit-Limit`.
    pub limit: u64,
    /// Tokens left, `0` on rejection.
    pub remaining: u64,
    pub retry_after_secs: u64,
    /// Clock reading of the attempt that produced this verdict.
    pub evaluated_at_ms: u64,
    /// Retries spent before the verdict.
    pub retries: usize,
    /// The verdict is a rejection only because contention outlasted the retry budget.
    pub contended: bool,
}

impl Admission {
    /// Build the verdict from the last attempt.
    pub fn from_attempt(attempt: Attempt, limit: u64, evaluated_at_ms: u64, retries: usize) -> Self {
        let (admitted, remaining, contended) = match attempt {
            Attempt::Admitted { remaining, .. } => (true, remaining, false),
            Attempt::Exhausted { .. } => (false, 0, false),
            Attempt::Contended { .. } => (false, 0, true),
        };
        Self {
            admitted,
            limit,
            remaining,
            retry_after_secs: attempt.retry_after_secs(),
            evaluated_at_ms,
            retries,
            contended,
        }
    }

    /// Epoch-millisecond estimate of when the next token is available.
    pub fn reset_at_ms(&self) -> u64 {
        self.evaluated_at_ms.saturating_add(self.retry_after_secs.saturating_mul(1000))
    }
}
