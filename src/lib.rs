#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bucketgate
//!
//! Token bucket rate limiting over a shared store, for fleets of async Rust services.
//!
//! ## Features
//!
//! - **One refill/consume engine** shared by every code path ([`engine`])
//! - **Two admission strategies**: atomic check-and-decrement in the store, or optimistic
//!   read-modify-write ([`strategies`])
//! - **Bounded fixed-delay retry** with injectable clock and sleeper ([`retry`])
//! - **Tower middleware** emitting `X-RateLimit-*` headers and `429`/`500` JSON bodies
//!   ([`middleware`])
//! - **Telemetry sinks** as `tower::Service<LimiterEvent>` ([`telemetry`])
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use bucketgate::{ClientAddr, InMemoryBucketStore, LimiterConfig, RateLimitLayer};
//! use http::{Request, Response, StatusCode};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = LimiterConfig::builder().bucket_size(1).build().unwrap();
//!     let layer = RateLimitLayer::from_config(Arc::new(InMemoryBucketStore::new()), &config);
//!     let svc = layer.layer(service_fn(|_req: Request<()>| async {
//!         Ok::<_, std::convert::Infallible>(Response::new(String::from("ok")))
//!     }));
//!
//!     let request = || {
//!         let mut req = Request::new(());
//!         req.extensions_mut().insert(ClientAddr("10.0.0.1:4000".parse().unwrap()));
//!         req
//!     };
//!     let first = svc.clone().oneshot(request()).await.unwrap();
//!     assert_eq!(first.status(), StatusCode::OK);
//!     assert_eq!(first.headers()["x-ratelimit-remaining"], "0");
//! }
//! ```

pub mod clock;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod key;
pub mod middleware;
pub mod prelude;
pub mod retry;
pub mod sleeper;
pub mod store;
pub mod strategies;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LimiterConfig, LimiterConfigBuilder};
pub use decision::{Admission, Attempt};
pub use engine::{evaluate, BucketLimits, BucketState, Evaluation};
pub use error::{ConfigError, LimiterError, StoreError};
pub use key::{ClientAddr, ClientKey, ForwardedFor, KeyExtractor, PeerAddr};
pub use middleware::{RateLimitLayer, RateLimitService, Verdict};
pub use retry::RetryController;
pub use sleeper::{InstantSleeper, SleepFuture, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{AtomicBucketStore, AtomicReply, BucketStore, InMemoryBucketStore};
pub use strategies::{AdmissionStrategy, AtomicScriptStrategy, OptimisticStrategy, StrategyKind};
