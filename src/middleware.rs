//! Tower middleware enforcing the limit on HTTP requests.
//!
//! Per request: `Start -> Evaluating -> {Admitted, Rejected, Errored}`.
//!
//! - **Admitted**: forwarded downstream; the downstream response gets `X-RateLimit-Limit`,
//!   `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
//! - **Rejected**: `429` with the same headers plus `X-RateLimit-Retry-After` and a JSON body
//!   `{"error":"Too Many Requests","retryAfter":<secs>}`.
//! - **Errored**: `500` with `{"error":"Internal Server Error"}`. Not forwarded.
//!
//! Rejections are responses, not errors: the service error type is the inner service's.

use futures::future::BoxFuture;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, warn};

use crate::config::LimiterConfig;
use crate::decision::Admission;
use crate::error::LimiterError;
use crate::key::{ClientKey, KeyExtractor, PeerAddr};
use crate::retry::RetryController;
use crate::store::{AtomicBucketStore, BucketStore};
use crate::telemetry::{NullSink, TelemetrySink};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_RETRY_AFTER: HeaderName = HeaderName::from_static("x-ratelimit-retry-after");

/// Terminal state of one request's evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admitted(Admission),
    Rejected(Admission),
    Errored(LimiterError),
}

/// A layer that enforces a shared token bucket per client.
pub struct RateLimitLayer<K = PeerAddr, T = NullSink> {
    controller: Arc<RetryController<T>>,
    extractor: Arc<K>,
    admission_timeout: Option<Duration>,
}

impl<K, T> Clone for RateLimitLayer<K, T> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            extractor: self.extractor.clone(),
            admission_timeout: self.admission_timeout,
        }
    }
}

impl<T: TelemetrySink> RateLimitLayer<PeerAddr, T> {
    /// Create a layer keyed on the peer address.
    pub fn new(controller: RetryController<T>) -> Self {
        Self { controller: Arc::new(controller), extractor: Arc::new(PeerAddr), admission_timeout: None }
    }
}

impl RateLimitLayer<PeerAddr, NullSink> {
    /// Wire strategy, retry budget and timeout from `config` over `store`.
    pub fn from_config<S>(store: Arc<S>, config: &LimiterConfig) -> Self
    where
        S: BucketStore + AtomicBucketStore + std::fmt::Debug + 'static,
    {
        let strategy = config.strategy().build(store, config.limits());
        RateLimitLayer::new(RetryController::from_config(strategy, config))
            .with_admission_timeout(config.admission_timeout())
    }
}

impl<K: KeyExtractor, T: TelemetrySink> RateLimitLayer<K, T> {
    /// Derive bucket keys with `extractor` instead.
    pub fn with_extractor<K2: KeyExtractor>(self, extractor: K2) -> RateLimitLayer<K2, T> {
        RateLimitLayer {
            controller: self.controller,
            extractor: Arc::new(extractor),
            admission_timeout: self.admission_timeout,
        }
    }

    /// Fail closed when evaluation (retries included) takes longer than `timeout`.
    pub fn with_admission_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.admission_timeout = timeout;
        self
    }

    pub fn controller(&self) -> &RetryController<T> {
        &self.controller
    }
}

impl<S, K, T> Layer<S> for RateLimitLayer<K, T> {
    type Service = RateLimitService<S, K, T>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            controller: self.controller.clone(),
            extractor: self.extractor.clone(),
            admission_timeout: self.admission_timeout,
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
pub struct RateLimitService<S, K = PeerAddr, T = NullSink> {
    inner: S,
    controller: Arc<RetryController<T>>,
    extractor: Arc<K>,
    admission_timeout: Option<Duration>,
}

impl<S: Clone, K, T> Clone for RateLimitService<S, K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            controller: self.controller.clone(),
            extractor: self.extractor.clone(),
            admission_timeout: self.admission_timeout,
        }
    }
}

impl<S, K, T, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, K, T>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    K: KeyExtractor,
    T: TelemetrySink,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let key = self.extractor.extract(&req);
        let controller = self.controller.clone();
        let admission_timeout = self.admission_timeout;
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match evaluate(&controller, &key, admission_timeout).await {
                Verdict::Admitted(admission) => {
                    let mut response = inner.call(req).await?;
                    set_limit_headers(response.headers_mut(), &admission);
                    Ok(response)
                }
                Verdict::Rejected(admission) => {
                    debug!(key = %key, retry_after = admission.retry_after_secs, "request rate limited");
                    Ok(too_many_requests(&admission))
                }
                Verdict::Errored(err) => {
                    // Store failures are already logged by the controller.
                    if err.is_timeout() {
                        warn!(key = %key, error = %err, "admission timed out; failing closed");
                    } else {
                        debug!(key = %key, error = %err, "no admission decision; failing closed");
                    }
                    Ok(internal_error())
                }
            }
        })
    }
}

/// Run the controller for `key`, bounded by `admission_timeout`.
pub async fn evaluate<T: TelemetrySink>(
    controller: &RetryController<T>,
    key: &ClientKey,
    admission_timeout: Option<Duration>,
) -> Verdict {
    let outcome = match admission_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, controller.admit(key.as_str())).await {
            Ok(outcome) => outcome.map_err(LimiterError::from),
            Err(_) => Err(LimiterError::Timeout { timeout }),
        },
        None => controller.admit(key.as_str()).await.map_err(LimiterError::from),
    };

    match outcome {
        Ok(admission) if admission.admitted => Verdict::Admitted(admission),
        Ok(admission) => Verdict::Rejected(admission),
        Err(err) => Verdict::Errored(err),
    }
}

fn set_limit_headers(headers: &mut HeaderMap, admission: &Admission) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(admission.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(admission.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(admission.reset_at_ms()));
}

fn json_response<B: From<String>>(status: StatusCode, body: serde_json::Value) -> Response<B> {
    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn too_many_requests<B: From<String>>(admission: &Admission) -> Response<B> {
    let mut response = json_response(
        StatusCode::TOO_MANY_REQUESTS,
        serde_json::json!({
            "error": "Too Many Requests",
            "retryAfter": admission.retry_after_secs,
        }),
    );
    let headers = response.headers_mut();
    set_limit_headers(headers, admission);
    headers.insert(X_RATELIMIT_RETRY_AFTER, HeaderValue::from(admission.retry_after_secs));
    response
}

fn internal_error<B: From<String>>() -> Response<B> {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        serde_json::json!({ "error": "Internal Server Error" }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Attempt;

    fn rejected() -> Admission {
        Admission::from_attempt(Attempt::Exhausted { retry_after_secs: 1 }, 210, 10_000, 0)
    }

    #[test]
    fn rejection_response_shape() {
        let response: Response<String> = too_many_requests(&rejected());

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[&X_RATELIMIT_LIMIT], "210");
        assert_eq!(headers[&X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[&X_RATELIMIT_RESET], "11000");
        assert_eq!(headers[&X_RATELIMIT_RETRY_AFTER], "1");
        assert_eq!(headers[CONTENT_TYPE], "application/json");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body, serde_json::json!({ "error": "Too Many Requests", "retryAfter": 1 }));
    }

    #[test]
    fn internal_error_shape() {
        let response: Response<String> = internal_error();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body(), r#"{"error":"Internal Server Error"}"#);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
    }
}
