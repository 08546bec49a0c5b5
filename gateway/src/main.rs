//! Gateway entry point.
//!
//! Wires the pieces together: configuration, logging, the Redis cache,
//! the bot worker pool, the default worker's dispatch loop and the HTTP
//! server. Startup is strict: a bad config, unreachable Redis or an
//! empty worker pool exits non-zero, while steady-state errors degrade
//! per-request instead.

mod access;
mod bot;
mod cache;
mod config;
mod handlers;
mod helpers;
mod state;
mod stream;
mod telegram;
mod templates;
mod users;
mod workers;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::access::AccessGate;
use crate::cache::Cache;
use crate::config::{Args, Config, ENVIRONMENT_LOCAL, REBALANCE_WINDOW_SECS, SHUTDOWN_GRACE_SECS};
use crate::state::AppState;
use crate::users::{CreditService, RedisCreditLedger};
use crate::workers::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_filter = if args.environment == ENVIRONMENT_LOCAL {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let cfg = Arc::new(Config::from_args(args));
    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %cfg.environment,
        "starting stream gateway"
    );

    let cache = Cache::connect(&cfg.redis_url)
        .await
        .context("failed to connect to redis")?;
    info!("connected to redis");

    let workers = workers::spawn_workers(&cfg).await;
    if workers.is_empty() {
        return Err(anyhow!("no bot workers are running"));
    }
    info!(workers = workers.len(), "worker pool ready");
    let pool = Arc::new(WorkerPool::new(
        workers,
        Duration::from_secs(REBALANCE_WINDOW_SECS),
    ));

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let state = AppState {
        gate: Arc::new(AccessGate::new(&cfg, cache.clone(), http_client)),
        pages: Arc::new(templates::Pages::new().context("failed to compile templates")?),
        commits: Arc::new(helpers::get_commits()),
        cfg: cfg.clone(),
        pool: pool.clone(),
        cache: cache.clone(),
    };

    let credits: Arc<dyn CreditService> = Arc::new(RedisCreditLedger::new(
        cache,
        cfg.initial_credits,
        cfg.max_credits,
    ));
    tokio::spawn(bot::run_dispatcher(state.clone(), credits));

    let app = Router::new()
        .route("/ping", get(handlers::ping))
        .route("/", get(handlers::landing_page))
        .route(
            "/stream/{channel_id}/{message_id}/{hash}",
            get(handlers::stream_file),
        )
        .route("/watch/{message_id}", get(handlers::watch_message))
        .route(
            "/watch/{channel_id}/{message_id}",
            get(handlers::watch_channel_message),
        )
        .route(
            "/hash/{channel_id}/{message_id}",
            get(handlers::hash_info),
        )
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .into_future(),
    );

    shutdown_signal().await;
    info!(grace_secs = SHUTDOWN_GRACE_SECS, "shutting down");
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), server).await {
        Ok(joined) => {
            joined.context("HTTP server task failed")??;
        }
        Err(_) => {
            warn!("graceful shutdown timed out, dropping open connections");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
