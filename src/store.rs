use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::engine::{evaluate, BucketLimits, BucketState};
use crate::error::StoreError;

/// `remaining` value reported by [`AtomicBucketStore::check_and_decrement`] for an empty bucket.
pub const REMAINING_EXHAUSTED: i64 = -1;
/// `remaining` value reported when the store detected contention and changed nothing.
pub const REMAINING_CONTENDED: i64 = -2;

/// Plain read/write access to per-key bucket state.
///
/// Reads and writes are separate round-trips; nothing ties a write to the read it was based on.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the current state for a key, `None` if the key was never written.
    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError>;

    /// Overwrite the state for a key.
    async fn set_bucket(&self, key: &str, state: BucketState) -> Result<(), StoreError>;
}

/// Reply of the store-side atomic check-and-decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicReply {
    /// Tokens left after the decrement, or one of [`REMAINING_EXHAUSTED`] /
    /// [`REMAINING_CONTENDED`].
    pub remaining: i64,
    pub retry_after_secs: u64,
}

impl AtomicReply {
    pub fn admitted(remaining: u64) -> Self {
        Self { remaining: i64::try_from(remaining).unwrap_or(i64::MAX), retry_after_secs: 0 }
    }

    pub fn exhausted(retry_after_secs: u64) -> Self {
        Self { remaining: REMAINING_EXHAUSTED, retry_after_secs }
    }

    pub fn contended(retry_after_secs: u64) -> Self {
        Self { remaining: REMAINING_CONTENDED, retry_after_secs }
    }
}

/// A store able to read, evaluate and write one key as a single indivisible operation.
///
/// Implementations must serialise concurrent calls for the same key: no two callers may act on
/// the same pre-decrement state. An empty bucket must not be written back, so that repeated
/// rejected requests do not push `last_refill_ms` forward and starve the refill.
#[async_trait]
pub trait AtomicBucketStore: Send + Sync {
    async fn check_and_decrement(
        &self,
        key: &str,
        now_ms: u64,
        limits: &BucketLimits,
    ) -> Result<AtomicReply, StoreError>;
}

#[async_trait]
impl<T: BucketStore + ?Sized> BucketStore for Arc<T> {
    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        (**self).get_bucket(key).await
    }

    async fn set_bucket(&self, key: &str, state: BucketState) -> Result<(), StoreError> {
        (**self).set_bucket(key, state).await
    }
}

#[async_trait]
impl<T: AtomicBucketStore + ?Sized> AtomicBucketStore for Arc<T> {
    async fn check_and_decrement(
        &self,
        key: &str,
        now_ms: u64,
        limits: &BucketLimits,
    ) -> Result<AtomicReply, StoreError> {
        (**self).check_and_decrement(key, now_ms, limits).await
    }
}

/// In-process bucket store. Clones share the same map.
///
/// The atomic path runs [`evaluate`] while holding the key's entry lock, so it is linearizable
/// per key within one process. Useful for single-instance deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBucketStore {
    buckets: Arc<DashMap<String, BucketState>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with stored state.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Snapshot one key without going through the async contract.
    pub fn peek(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|entry| *entry)
    }

    /// Seed a key, e.g. to start a test from an empty bucket.
    pub fn insert(&self, key: impl Into<String>, state: BucketState) {
        self.buckets.insert(key.into(), state);
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        Ok(self.peek(key))
    }

    async fn set_bucket(&self, key: &str, state: BucketState) -> Result<(), StoreError> {
        self.buckets.insert(key.to_string(), state);
        Ok(())
    }
}

#[async_trait]
impl AtomicBucketStore for InMemoryBucketStore {
    async fn check_and_decrement(
        &self,
        key: &str,
        now_ms: u64,
        limits: &BucketLimits,
    ) -> Result<AtomicReply, StoreError> {
        // The entry guard holds the shard write lock until it is dropped.
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState::full(limits, now_ms));
        let eval = evaluate(*entry, now_ms, limits);
        if eval.admitted {
            *entry = eval.state;
            Ok(AtomicReply::admitted(eval.state.tokens))
        } else {
            Ok(AtomicReply::exhausted(eval.retry_after_secs))
        }
    }
}
