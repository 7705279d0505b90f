mod common;

use bucketgate::telemetry::{LimiterEvent, LogSink, MemorySink};
use bucketgate::{
    BucketState, ForwardedFor, InMemoryBucketStore, InstantSleeper, LimiterConfig, ManualClock,
    PeerAddr, RateLimitLayer, RetryController, StrategyKind,
};
use common::{init_tracing, CapturedLogs, request_from, ContendedStore, DownStore, HungStore, NOW};
use http::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{service_fn, Layer, Service, ServiceExt};

const PEER: &str = "203.0.113.9:41000";
const KEY: &str = "ratelimit:203.0.113.9";

/// Downstream handler counting how often it ran.
fn downstream(hits: Arc<AtomicUsize>) -> BoxCloneService<Request<()>, Response<String>, Infallible> {
    BoxCloneService::new(service_fn(move |_req: Request<()>| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(Response::new(
                r#"{"message":"Request processed successfully"}"#.to_string(),
            ))
        }
    }))
}

fn layer_over(store: Arc<InMemoryBucketStore>, sink: MemorySink) -> RateLimitLayer<PeerAddr, MemorySink> {
    let config = LimiterConfig::default();
    let controller = RetryController::from_config(
        StrategyKind::Atomic.build(store, config.limits()),
        &config,
    )
    .with_clock(ManualClock::new(NOW))
    .with_sink(sink);
    RateLimitLayer::new(controller)
}

#[tokio::test]
async fn full_bucket_is_admitted_with_headers() {
    let store = Arc::new(InMemoryBucketStore::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let svc = layer_over(store.clone(), MemorySink::new()).layer(downstream(hits.clone()));

    let response = svc.oneshot(request_from(PEER)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "210");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "209");
    assert_eq!(response.headers()["x-ratelimit-reset"], NOW.to_string().as_str());
    assert!(response.headers().get("x-ratelimit-retry-after").is_none());
    assert_eq!(response.body(), r#"{"message":"Request processed successfully"}"#);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(store.peek(KEY), Some(BucketState::new(209, NOW)));
}

#[tokio::test]
async fn partial_refill_is_admitted() {
    let store = Arc::new(InMemoryBucketStore::new());
    store.insert(KEY, BucketState::new(0, NOW - 500));
    let hits = Arc::new(AtomicUsize::new(0));
    let svc = layer_over(store, MemorySink::new()).layer(downstream(hits.clone()));

    let response = svc.oneshot(request_from(PEER)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-remaining"], "4");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_bucket_is_rejected_without_forwarding() {
    let store = Arc::new(InMemoryBucketStore::new());
    store.insert(KEY, BucketState::new(0, NOW - 50));
    let hits = Arc::new(AtomicUsize::new(0));
    let sink = MemorySink::new();
    let svc = layer_over(store.clone(), sink.clone()).layer(downstream(hits.clone()));

    let response = svc.oneshot(request_from(PEER)).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-ratelimit-limit"], "210");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(response.headers()["x-ratelimit-retry-after"], "1");
    assert_eq!(response.headers()["x-ratelimit-reset"], (NOW + 1000).to_string().as_str());
    assert_eq!(response.headers()["content-type"], "application/json");
    let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
    assert_eq!(body, serde_json::json!({ "error": "Too Many Requests", "retryAfter": 1 }));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Rejection is not persisted.
    assert_eq!(store.peek(KEY), Some(BucketState::new(0, NOW - 50)));
    assert_eq!(
        sink.events(),
        vec![LimiterEvent::Rejected { key: KEY.into(), retry_after_secs: 1 }]
    );
}

#[tokio::test]
async fn bucket_emptied_this_instant_waits_one_second() {
    init_tracing();
    let store = Arc::new(InMemoryBucketStore::new());
    store.insert(KEY, BucketState::new(0, NOW));
    let hits = Arc::new(AtomicUsize::new(0));
    let svc = layer_over(store.clone(), MemorySink::new()).layer(downstream(hits.clone()));

    let response = svc.oneshot(request_from(PEER)).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-ratelimit-retry-after"], "1");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
    assert_eq!(body["retryAfter"], 1);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(store.peek(KEY), Some(BucketState::new(0, NOW)));
}

#[tokio::test]
async fn contention_outlasting_retries_is_a_zero_wait_rejection() {
    init_tracing();
    let config = LimiterConfig::default();
    let sink = MemorySink::new();
    let controller = RetryController::from_config(
        StrategyKind::Atomic.build(Arc::new(ContendedStore), config.limits()),
        &config,
    )
    .with_clock(ManualClock::new(NOW))
    .with_sleeper(InstantSleeper)
    .with_sink(sink.clone());
    let hits = Arc::new(AtomicUsize::new(0));
    let svc = RateLimitLayer::new(controller).layer(downstream(hits.clone()));

    let response = svc.oneshot(request_from(PEER)).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-ratelimit-limit"], "210");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(response.headers()["x-ratelimit-retry-after"], "0");
    assert_eq!(response.headers()["x-ratelimit-reset"], NOW.to_string().as_str());
    let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
    assert_eq!(body, serde_json::json!({ "error": "Too Many Requests", "retryAfter": 0 }));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, LimiterEvent::RetriesExhausted { retries: 3, .. })));
}

#[tokio::test]
async fn distinct_clients_use_distinct_buckets() {
    let store = Arc::new(InMemoryBucketStore::new());
    store.insert(KEY, BucketState::new(0, NOW));
    let hits = Arc::new(AtomicUsize::new(0));
    let mut svc = layer_over(store, MemorySink::new()).layer(downstream(hits.clone()));

    let blocked = svc.ready().await.unwrap().call(request_from(PEER)).await.unwrap();
    let other = svc.ready().await.unwrap().call(request_from("198.51.100.1:5000")).await.unwrap();

    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn store_failure_fails_closed() {
    init_tracing();
    let config = LimiterConfig::default();
    let layer = RateLimitLayer::from_config(Arc::new(DownStore), &config);
    let hits = Arc::new(AtomicUsize::new(0));
    let svc = layer.layer(downstream(hits.clone()));

    let response = svc.oneshot(request_from(PEER)).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.body(), r#"{"error":"Internal Server Error"}"#);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn store_failure_warns_once() {
    let logs = CapturedLogs::default();
    let _guard = logs.install();
    let config = LimiterConfig::default();
    let controller = RetryController::from_config(
        StrategyKind::Atomic.build(Arc::new(DownStore), config.limits()),
        &config,
    )
    .with_sink(LogSink);
    let svc = RateLimitLayer::new(controller).layer(downstream(Arc::new(AtomicUsize::new(0))));

    let response = svc.oneshot(request_from(PEER)).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let warnings = logs.lines_at("WARN");
    assert_eq!(warnings.len(), 1, "{warnings:#?}");
    assert!(warnings[0].contains("connection refused"), "{warnings:#?}");
}

#[tokio::test(start_paused = true)]
async fn admission_timeout_fails_closed() {
    let config = LimiterConfig::builder()
        .admission_timeout(Some(Duration::from_millis(250)))
        .build()
        .unwrap();
    let layer = RateLimitLayer::from_config(Arc::new(HungStore), &config);
    let hits = Arc::new(AtomicUsize::new(0));
    let svc = layer.layer(downstream(hits.clone()));

    let start = tokio::time::Instant::now();
    let response = svc.oneshot(request_from(PEER)).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(start.elapsed(), Duration::from_millis(250));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn forwarded_for_keys_on_first_hop() {
    let store = Arc::new(InMemoryBucketStore::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let svc = layer_over(store.clone(), MemorySink::new())
        .with_extractor(ForwardedFor)
        .layer(downstream(hits));

    let mut req = request_from("127.0.0.1:9000");
    req.headers_mut().insert("x-forwarded-for", "192.0.2.44, 10.0.0.1".parse().unwrap());
    let response = svc.oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(store.peek("ratelimit:192.0.2.44").is_some());
    assert!(store.peek("ratelimit:127.0.0.1").is_none());
}
