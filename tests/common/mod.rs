#![allow(dead_code)]

use async_trait::async_trait;
use bucketgate::{
    AtomicBucketStore, AtomicReply, BucketLimits, BucketState, BucketStore, ClientAddr,
    InMemoryBucketStore, StoreError,
};
use http::Request;
use std::sync::Arc;
use tokio::sync::Barrier;
use tracing_subscriber::EnvFilter;

pub const NOW: u64 = 1_700_000_000_000;

/// Route limiter logs to the test harness output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// Request as a server would hand it to the layer, with the peer address attached.
pub fn request_from(peer: &str) -> Request<()> {
    let mut req = Request::builder().uri("/api/data").body(()).expect("valid request");
    req.extensions_mut().insert(ClientAddr(peer.parse().expect("valid socket addr")));
    req
}

/// Holds every reader until `parties` reads have happened, so all of them observe the same
/// pre-write state.
#[derive(Debug)]
pub struct LockstepStore {
    inner: InMemoryBucketStore,
    barrier: Arc<Barrier>,
}

impl LockstepStore {
    pub fn new(inner: InMemoryBucketStore, parties: usize) -> Self {
        Self { inner, barrier: Arc::new(Barrier::new(parties)) }
    }
}

#[async_trait]
impl BucketStore for LockstepStore {
    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        let state = self.inner.get_bucket(key).await?;
        self.barrier.wait().await;
        Ok(state)
    }

    async fn set_bucket(&self, key: &str, state: BucketState) -> Result<(), StoreError> {
        self.inner.set_bucket(key, state).await
    }
}

#[async_trait]
impl AtomicBucketStore for LockstepStore {
    async fn check_and_decrement(
        &self,
        key: &str,
        now_ms: u64,
        limits: &BucketLimits,
    ) -> Result<AtomicReply, StoreError> {
        self.inner.check_and_decrement(key, now_ms, limits).await
    }
}

/// A store whose every call fails.
#[derive(Debug, Clone, Copy)]
pub struct DownStore;

#[async_trait]
impl BucketStore for DownStore {
    async fn get_bucket(&self, _key: &str) -> Result<Option<BucketState>, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn set_bucket(&self, _key: &str, _state: BucketState) -> Result<(), StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
}

#[async_trait]
impl AtomicBucketStore for DownStore {
    async fn check_and_decrement(
        &self,
        _key: &str,
        _now_ms: u64,
        _limits: &BucketLimits,
    ) -> Result<AtomicReply, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
}

/// A store that never answers.
#[derive(Debug, Clone, Copy)]
pub struct HungStore;

#[async_trait]
impl BucketStore for HungStore {
    async fn get_bucket(&self, _key: &str) -> Result<Option<BucketState>, StoreError> {
        std::future::pending().await
    }

    async fn set_bucket(&self, _key: &str, _state: BucketState) -> Result<(), StoreError> {
        std::future::pending().await
    }
}

#[async_trait]
impl AtomicBucketStore for HungStore {
    async fn check_and_decrement(
        &self,
        _key: &str,
        _now_ms: u64,
        _limits: &BucketLimits,
    ) -> Result<AtomicReply, StoreError> {
        std::future::pending().await
    }
}

/// An atomic store that always reports contention.
#[derive(Debug, Clone, Copy)]
pub struct ContendedStore;

#[async_trait]
impl BucketStore for ContendedStore {
    async fn get_bucket(&self, _key: &str) -> Result<Option<BucketState>, StoreError> {
        Ok(None)
    }

    async fn set_bucket(&self, _key: &str, _state: BucketState) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl AtomicBucketStore for ContendedStore {
    async fn check_and_decrement(
        &self,
        _key: &str,
        _now_ms: u64,
        _limits: &BucketLimits,
    ) -> Result<AtomicReply, StoreError> {
        Ok(AtomicReply::contended(0))
    }
}

/// In-memory log sink for asserting on emitted log lines.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Install as the default subscriber for the current thread until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("debug"))
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines_at(&self, level: &str) -> Vec<String> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|line| line.split_whitespace().nth(1) == Some(level))
            .map(str::to_string)
            .collect()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
