use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bucketgate::{InMemoryBucketStore, StrategyKind};
use bucketgate_redis::RedisBucketStore;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod web;
mod settings;

use settings::{Backend, Settings};

/// HTTP server demonstrating the bucketgate rate limiter.
#[derive(Debug, Parser)]
#[command(name = "bucketgate-server", version, about)]
struct Args {
    /// YAML settings file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:3000.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Use the Redis backend at this URL.
    #[arg(long)]
    redis_url: Option<String>,

    /// Admission strategy: atomic or optimistic.
    #[arg(long)]
    strategy: Option<StrategyKind>,

    /// Key clients on X-Forwarded-For.
    #[arg(long)]
    trust_forwarded_for: bool,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    if let Some(listen) = args.listen {
        settings.server.listen = listen;
    }
    if let Some(url) = args.redis_url {
        settings.store.backend = Backend::Redis;
        settings.store.redis_url = url;
    }
    if let Some(strategy) = args.strategy {
        settings.limiter.strategy = strategy;
    }
    settings.server.trust_forwarded_for |= args.trust_forwarded_for;
    settings.log.json |= args.json_logs;

    init_tracing(settings.log.json);
    info!(version = env!("CARGO_PKG_VERSION"), "starting bucketgate server");

    let config = settings.limiter_config().context("invalid limiter settings")?;
    info!(
        bucket_size = config.bucket_size(),
        refill_rate = config.refill_rate(),
        max_retries = config.max_retries(),
        retry_delay = ?config.retry_delay(),
        strategy = %config.strategy(),
        backend = ?settings.store.backend,
        "limiter configured"
    );

    let trust = settings.server.trust_forwarded_for;
    let service = match settings.store.backend {
        Backend::Memory => web::app(Arc::new(InMemoryBucketStore::new()), &config, trust),
        Backend::Redis => {
            let store = RedisBucketStore::connect(&settings.store.redis_url)
                .await
                .with_context(|| format!("connecting to {}", settings.store.redis_url))?;
            web::app(Arc::new(store), &config, trust)
        }
    };

    let listener = TcpListener::bind(settings.server.listen)
        .await
        .with_context(|| format!("binding {}", settings.server.listen))?;
    web::serve(listener, service, shutdown_signal()).await?;

    info!("bucketgate server stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, initiating graceful shutdown");
        }
    }
}
