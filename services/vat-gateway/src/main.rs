//! HMRC VAT Gateway
//!
//! Single-binary Rust service that:
//! 1. Runs the HMRC OAuth authorization-code flow and issues signed session tokens
//! 2. Relays VAT (MTD) API calls with the access credential from the session
//! 3. Refreshes expired credentials transparently and hands back the new session
//! 4. Exposes `/health` and Prometheus `/metrics`

mod config;
mod error;
mod metrics;
mod routes;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use hmrc_auth::{Clock, MemoryStateStore, SystemClock, spawn_sweep_task};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vat_relay::{BrokerSettings, EndpointRegistry, MemoryRefreshCache, VatBroker};

use crate::config::Config;

/// Time allowed for in-flight requests to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) broker: Arc<VatBroker>,
    pub(crate) post_login_redirect: Arc<str>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the broker and handler state from loaded configuration.
fn build_state(
    config: &Config,
    clock: Arc<dyn Clock>,
    prometheus: PrometheusHandle,
) -> Result<AppState> {
    let registry = EndpointRegistry::hmrc_vat()
        .and_then(|registry| registry.with_overrides(&config.endpoints))
        .context("invalid endpoint configuration")?;
    let signing_key = config
        .session
        .signing_key
        .clone()
        .context("session signing key not loaded")?;

    let settings = BrokerSettings {
        provider: config.provider_config()?,
        api_base_url: config.hmrc.api_base_url()?,
        signing_key,
        session_ttl: config.session.session_ttl(),
        refresh_margin: config.session.refresh_margin(),
        registry,
        http: reqwest::Client::new(),
    };
    let broker = VatBroker::new(
        settings,
        Arc::new(MemoryStateStore::new(
            config.session.state_ttl(),
            clock.clone(),
        )),
        Arc::new(MemoryRefreshCache::new(
            config.session.refresh_reuse(),
            clock.clone(),
        )),
        clock,
    );

    Ok(AppState {
        broker: Arc::new(broker),
        post_login_redirect: Arc::from(config.server.post_login_redirect.as_str()),
        prometheus,
        started_at: Instant::now(),
    })
}

/// Build the axum router with all routes and shared state.
///
/// Excess concurrent requests beyond `max_connections` queue. The limit is
/// shared by every route, since `Router::layer` wraps each route separately.
fn build_router(state: AppState, max_connections: usize) -> Router {
    routes::api_routes()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(track_requests))
        .layer(tower::limit::GlobalConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting vat-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
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
        listen_addr = %config.server.listen_addr,
        environment = ?config.hmrc.environment,
        endpoint_overrides = config.endpoints.len(),
        "configuration loaded"
    );

    let state = build_state(&config, Arc::new(SystemClock), prometheus_handle)?;
    let sweeper = spawn_sweep_task(state.broker.state_store(), config.session.sweep_interval());

    let app = build_router(state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    sweeper.abort();
    info!("shutdown complete");
    Ok(())
}

/// Record route metrics and log every request with a generated id.
async fn track_requests(request: Request, next: Next) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = request.method().clone();
    let start = Instant::now();

    let mut response = next.run(request).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    metrics::record_request(&route, status, elapsed.as_secs_f64());
    info!(
        request_id = %request_id,
        method = %method,
        route = %route,
        status,
        latency_ms = elapsed.as_millis() as u64,
        "request completed"
    );
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Health endpoint: the process is up and serving.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
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

/// Wait for SIGTERM or SIGINT for graceful shutdown.
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
