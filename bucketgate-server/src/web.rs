//! HTTP front: routing, CORS and the accept loop.
//!
//! Every request passes through the rate limiter before routing, unknown paths included.

use std::convert::Infallible;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use bucketgate::telemetry::LogSink;
use bucketgate::{
    AtomicBucketStore, BucketStore, ClientAddr, ForwardedFor, KeyExtractor, LimiterConfig,
    RateLimitLayer, RetryController,
};
use http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, CONTENT_TYPE,
};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};
use tracing::{debug, info, warn};

pub type Body = Full<Bytes>;

/// The full request pipeline: CORS, rate limiting, routing.
pub type AppService<B> = BoxCloneService<Request<B>, Response<Body>, Infallible>;

const EXPOSED_HEADERS: &str =
    "X-RateLimit-Limit, X-RateLimit-Remaining, X-RateLimit-Reset, X-RateLimit-Retry-After";

/// Build the pipeline over `store`.
pub fn app<B, St>(store: Arc<St>, config: &LimiterConfig, trust_forwarded_for: bool) -> AppService<B>
where
    B: Send + 'static,
    St: BucketStore + AtomicBucketStore + Debug + 'static,
{
    let strategy = config.strategy().build(store, config.limits());
    let controller = RetryController::from_config(strategy, config).with_sink(LogSink);
    let layer = RateLimitLayer::new(controller).with_admission_timeout(config.admission_timeout());

    if trust_forwarded_for {
        pipeline(layer.with_extractor(ForwardedFor))
    } else {
        pipeline(layer)
    }
}

fn pipeline<B, K>(limiter: RateLimitLayer<K, LogSink>) -> AppService<B>
where
    B: Send + 'static,
    K: KeyExtractor,
{
    BoxCloneService::new(
        ServiceBuilder::new()
            .map_response(with_cors)
            .layer(limiter)
            .service_fn(route::<B>),
    )
}

async fn route<B>(req: Request<B>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/api/data") => json(
            StatusCode::OK,
            serde_json::json!({ "message": "Request processed successfully" }),
        ),
        _ => json(StatusCode::NOT_FOUND, serde_json::json!({ "error": "Not Found" })),
    };
    Ok(response)
}

fn json(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn with_cors(mut response: Response<Body>) -> Response<Body> {
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static(EXPOSED_HEADERS));
    response
}

/// Accept connections until `shutdown` resolves, then drain.
///
/// Each request is tagged with the connection's peer address before entering the pipeline.
/// On shutdown the listener closes, every open connection is told to finish its current
/// request and close, and `serve` returns once all of them have.
pub async fn serve(
    listener: TcpListener,
    service: AppService<Incoming>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut shutdown = std::pin::pin!(shutdown);
    let (drain_tx, drain_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    info!(addr = %listener.local_addr()?, "listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let service = service.clone();
                let mut drain = drain_rx.clone();

                connections.spawn(async move {
                    let conn_service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
                        req.extensions_mut().insert(ClientAddr(peer));
                        service.clone().oneshot(req)
                    });
                    let conn = http1::Builder::new().serve_connection(io, conn_service);
                    let mut conn = std::pin::pin!(conn);
                    let mut draining = false;

                    loop {
                        tokio::select! {
                            result = conn.as_mut() => {
                                if let Err(e) = result {
                                    debug!(%peer, error = %e, "connection error");
                                }
                                break;
                            }
                            _ = drain.changed(), if !draining => {
                                draining = true;
                                conn.as_mut().graceful_shutdown();
                            }
                        }
                    }
                });
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "connection task failed");
                }
            }
            _ = &mut shutdown => {
                info!("http server shutting down");
                break;
            }
        }
    }

    drop(listener);
    let _ = drain_tx.send(true);
    info!(open = connections.len(), "draining connections");
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "connection task failed");
        }
    }
    info!("http server stopped");

    Ok(())
}
