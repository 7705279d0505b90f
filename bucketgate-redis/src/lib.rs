//! Redis bucket store for `bucketgate` (companion crate).
//!
//! Each key is a hash with fields `tokens` and `lastRefill` (epoch ms). The atomic path runs
//! `bucket.lua` server-side, so Redis serialises every check-and-decrement on a key.

use async_trait::async_trait;
use bucketgate::{AtomicBucketStore, AtomicReply, BucketLimits, BucketState, BucketStore, StoreError};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, Script};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

const TOKENS_FIELD: &str = "tokens";
const LAST_REFILL_FIELD: &str = "lastRefill";

/// Default deadline for one Redis round-trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Bucket store backed by a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisBucketStore {
    conn: ConnectionManager,
    script: Script,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("conn", &"<redis::aio::ConnectionManager>")
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisBucketStore {
    /// Connect to `url` and verify the server answers `PING`.
    ///
    /// # Errors
    /// Returns `StoreError::Unavailable` if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        let conn = client.get_connection_manager().await.map_err(map_redis_error)?;
        let store = Self::new(conn);
        store.ping().await?;
        tracing::info!(target: "bucketgate::redis", "connected to redis bucket store");
        Ok(store)
    }

    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, script: Script::new(include_str!("bucket.lua")), command_timeout: DEFAULT_COMMAND_TIMEOUT }
    }

    /// Fail calls that take longer than `timeout`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        if pong != "PONG" {
            return Err(StoreError::malformed(format!("unexpected PING reply `{pong}`")));
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.command_timeout, call).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = self.bounded(conn.hgetall(key)).await?;
        parse_bucket(&fields)
    }

    async fn set_bucket(&self, key: &str, state: BucketState) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let items = [(TOKENS_FIELD, state.tokens), (LAST_REFILL_FIELD, state.last_refill_ms)];
        let _: () = self.bounded(conn.hset_multiple(key, &items)).await?;
        Ok(())
    }
}

#[async_trait]
impl AtomicBucketStore for RedisBucketStore {
    async fn check_and_decrement(
        &self,
        key: &str,
        now_ms: u64,
        limits: &BucketLimits,
    ) -> Result<AtomicReply, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(key);
        invocation.arg(now_ms).arg(limits.bucket_size).arg(limits.refill_rate);
        let reply: Vec<i64> = self.bounded(invocation.invoke_async(&mut conn)).await?;

        match reply.as_slice() {
            [remaining, retry_after] if *retry_after >= 0 => Ok(AtomicReply {
                remaining: *remaining,
                retry_after_secs: *retry_after as u64,
            }),
            other => Err(StoreError::malformed(format!("script returned {other:?}"))),
        }
    }
}

/// Decode an `HGETALL` reply. An empty hash is an unknown key.
fn parse_bucket(fields: &HashMap<String, String>) -> Result<Option<BucketState>, StoreError> {
    if fields.is_empty() {
        return Ok(None);
    }
    let field = |name: &str| -> Result<u64, StoreError> {
        let raw = fields
            .get(name)
            .ok_or_else(|| StoreError::malformed(format!("missing field `{name}`")))?;
        raw.parse::<u64>()
            .map_err(|e| StoreError::malformed(format!("field `{name}`=`{raw}`: {e}")))
    };
    Ok(Some(BucketState::new(field(TOKENS_FIELD)?, field(LAST_REFILL_FIELD)?)))
}

fn map_redis_error(e: RedisError) -> StoreError {
    match e.kind() {
        ErrorKind::TypeError => StoreError::malformed(e.to_string()),
        _ => StoreError::unavailable(e.to_string()),
    }
}
