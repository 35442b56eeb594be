//! F&O streaming core — server entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{FromRef, State};
use axum::middleware as axum_mw;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fno_core::config::Config;
use fno_core::middleware::rate_limit::{RateLimitConfig, RateLimitLayer};
use fno_core::runtime::Runtime;
use fno_core::ws::{websocket_handler, WsState};

#[derive(Clone)]
struct OpsState {
    runtime: Arc<Runtime>,
    prometheus: PrometheusHandle,
}

impl FromRef<OpsState> for Arc<Runtime> {
    fn from_ref(state: &OpsState) -> Self {
        state.runtime.clone()
    }
}

impl FromRef<OpsState> for PrometheusHandle {
    fn from_ref(state: &OpsState) -> Self {
        state.prometheus.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("fno-core starting up");

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();
    let rate_limit_config = RateLimitConfig {
        max_requests: config.rate_limit.max_requests,
        window: config.rate_limit.window,
        burst: config.rate_limit.max_requests / 5,
    };

    let runtime = Runtime::bootstrap(config).await.context("failed to bootstrap runtime")?;

    let ws_state = WsState { hub: runtime.market_hub.clone(), verifier: runtime.jwt_verifier.clone() };
    let rate_limiter = RateLimitLayer::new(rate_limit_config);

    let prometheus_handle = PrometheusBuilder::new().install_recorder().context("failed to install prometheus recorder")?;

    let ws_routes = Router::new()
        .route("/ws", get(websocket_handler))
        .route_layer(axum_mw::from_fn_with_state(rate_limiter, fno_core::middleware::rate_limit::rate_limit_middleware))
        .with_state(ws_state);

    let ops_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/metrics", get(metrics_handler))
        .with_state(OpsState { runtime: runtime.clone(), prometheus: prometheus_handle });

    let app = Router::new()
        .merge(ws_routes)
        .merge(ops_routes)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(fno_core::middleware::logging::request_logging_simple));

    let addr: SocketAddr = bind_addr.parse().context("invalid SERVER_BIND_ADDR")?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let shutdown_runtime = runtime.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_runtime))
        .await
        .context("server error")?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

async fn ready_check(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    if runtime.is_ready() {
        (axum::http::StatusCode::OK, "ready")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

async fn shutdown_signal(runtime: Arc<Runtime>) {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler") };

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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    runtime.shutdown().await;
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "fno_core=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
