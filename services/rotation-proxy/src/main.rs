//! Claude rotation proxy
//!
//! Single-binary reverse proxy that multiplexes client requests across a
//! pool of independently-authenticated Claude accounts:
//! 1. Loads the credentials document into the rotation pool
//! 2. Dispatches each request with round-robin selection and failover
//! 3. Refreshes OAuth tokens proactively in the background
//! 4. Hot-reloads the pool when the document changes on disk
//!
//! The admin surface (pool status, force-refresh, enable/disable) binds a
//! separate loopback listener.

mod admin;
mod config;
mod dispatch;
mod metrics;
mod service;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use claude_accounts::{AccountsDocument, CredentialsStore, TokenClient};
use claude_pool::{
    Pool, PoolConfig, RefreshConfig, SystemClock, WatcherConfig, spawn_refresh_task, spawn_watcher,
};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::dispatch::DispatchState;
use crate::service::{
    DRAIN_TIMEOUT, ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event,
};

/// TCP connect timeout for the upstream client (distinct from per-request
/// deadlines).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum idle upstream connections per host.
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// How long shutdown waits for background tasks after the server drains.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state for the proxy listener.
#[derive(Clone)]
struct AppState {
    dispatch: DispatchState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the proxy router. Health and metrics sit outside the concurrency
/// limit so probes and scrapes are never starved by slow dispatches.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let proxy_routes = Router::new()
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(proxy_routes)
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting claude-rotation-proxy");

    let prometheus_handle = metrics::install_recorder();

    let mut state = ServiceState::Initializing;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        rotation_enabled = config.pool.rotation_enabled,
        hot_reload = config.pool.hot_reload,
        max_attempts = config.proxy.max_attempts,
        "configuration loaded"
    );

    let (new_state, action) = handle_event(state, ServiceEvent::ConfigLoaded);
    state = new_state;
    anyhow::ensure!(
        matches!(action, ServiceAction::LoadPool),
        "unexpected action after ConfigLoaded: {action:?}"
    );

    // --- Credentials and pool ---
    let accounts_path = config.accounts_path();
    let store = Arc::new(CredentialsStore::new(accounts_path.clone()));
    let document = if store.exists() {
        store.load().await.with_context(|| {
            format!(
                "credentials document at {} is invalid",
                accounts_path.display()
            )
        })?
    } else {
        warn!(
            path = %accounts_path.display(),
            "credentials document not found, starting with an empty pool"
        );
        AccountsDocument::empty()
    };

    let pool = Arc::new(Pool::new(
        &document,
        PoolConfig {
            rotation_enabled: config.pool.rotation_enabled,
            minimum_cooldown: config.minimum_cooldown(),
        },
        Arc::new(SystemClock),
    ));

    info!(accounts = document.accounts.len(), "pool ready");
    let (new_state, action) = handle_event(state, ServiceEvent::PoolReady);
    state = new_state;
    anyhow::ensure!(
        matches!(action, ServiceAction::StartListeners),
        "unexpected action after PoolReady: {action:?}"
    );

    // --- HTTP client and background tasks ---
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
        .context("failed to build HTTP client")?;

    let token_client = TokenClient::new(
        client.clone(),
        config.oauth.token_endpoint_url.clone(),
        config.oauth.client_id.clone(),
        config.refresh_timeout(),
    );

    let shutdown_tasks = CancellationToken::new();
    let refresh_handle = spawn_refresh_task(
        pool.clone(),
        token_client,
        store.clone(),
        RefreshConfig {
            interval: config.refresh_interval(),
            refresh_buffer: config.refresh_buffer(),
        },
        shutdown_tasks.clone(),
    );

    let watcher_handle = if config.pool.hot_reload {
        Some(
            spawn_watcher(
                pool.clone(),
                store.clone(),
                WatcherConfig {
                    debounce: config.watch_debounce(),
                },
                shutdown_tasks.clone(),
            )
            .context("failed to start credentials watcher")?,
        )
    } else {
        info!("hot reload disabled, document changes require a restart");
        None
    };

    // --- Listeners ---
    let service_metrics = ServiceMetrics::new();
    let dispatch_state = DispatchState {
        client,
        upstream_url: config.proxy.upstream_url.clone(),
        pool: pool.clone(),
        clock: Arc::new(SystemClock),
        max_attempts: config.proxy.max_attempts,
        rotation_enabled: config.pool.rotation_enabled,
        total_timeout: config.total_timeout(),
        idle_timeout: config.idle_timeout(),
        requests_total: service_metrics.requests_total.clone(),
        errors_total: service_metrics.errors_total.clone(),
        failovers_total: service_metrics.failovers_total.clone(),
        in_flight: service_metrics.in_flight.clone(),
    };

    let app = build_router(
        AppState {
            dispatch: dispatch_state,
            metrics: service_metrics.clone(),
            prometheus: prometheus_handle,
        },
        config.proxy.max_connections,
    );

    let listener = TcpListener::bind(config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.proxy.listen_addr))?;

    let admin_listener = TcpListener::bind(config.admin.listen_addr)
        .await
        .with_context(|| format!("failed to bind admin to {}", config.admin.listen_addr))?;
    let admin_app = build_admin_router(AdminState { pool: pool.clone() });
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(admin_listener, admin_app).await {
            error!(error = %e, "admin listener failed");
        }
    });
    info!(addr = %config.admin.listen_addr, "admin surface listening");

    let (new_state, _action) = handle_event(state, ServiceEvent::ListenerReady);
    state = new_state;
    info!(addr = %config.proxy.listen_addr, "state: Running — accepting requests");

    // --- Graceful shutdown ---
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting connections and drains in-flight requests,
    //    bounded by DRAIN_TIMEOUT measured from signal receipt
    // 3. background tasks are cancelled and drained (an in-flight refresh
    //    completes so its single-flight guard is released cleanly)
    let in_flight = service_metrics.in_flight.clone();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let (new_state, _action) = handle_event(state, ServiceEvent::ShutdownSignal);
    state = new_state;
    info!("state: Draining");

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => {
            warn!(
                remaining = in_flight.load(Ordering::Relaxed),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    shutdown_tasks.cancel();
    if tokio::time::timeout(TASK_STOP_TIMEOUT, refresh_handle)
        .await
        .is_err()
    {
        warn!("refresh scheduler did not stop in time");
    }
    if let Some(handle) = watcher_handle
        && tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await.is_err()
    {
        warn!("credentials watcher did not stop in time");
    }
    admin_handle.abort();

    let (_state, _action) = handle_event(state, ServiceEvent::DrainComplete);
    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: service counters plus the pool snapshot. Pool health
/// maps all-available → healthy, some → degraded, none → unhealthy.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let failovers = state.metrics.failovers_total.load(Ordering::Relaxed);

    let view = state.dispatch.pool.snapshot().await;
    let status = if view.total > 0 && view.available == view.total {
        "healthy"
    } else if view.available > 0 {
        "degraded"
    } else {
        "unhealthy"
    };

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "failovers_total": failovers,
        "pool": serde_json::to_value(&view).unwrap_or_default(),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler proxying everything that isn't health or metrics.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    dispatch::dispatch(&state.dispatch, request, request_id).await
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
