//! Convenient re-exports for common bucketgate types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::{LimiterConfig, LimiterConfigBuilder},
    decision::Admission,
    engine::{BucketLimits, BucketState},
    error::{ConfigError, LimiterError, StoreError},
    key::{ClientAddr, ForwardedFor, KeyExtractor, PeerAddr},
    middleware::{RateLimitLayer, RateLimitService},
    retry::RetryController,
    store::{AtomicBucketStore, BucketStore, InMemoryBucketStore},
    strategies::{AdmissionStrategy, StrategyKind},
    telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink},
};
