use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::handlers::{health_check, render_metrics, stats, AppState, SharedState};
use crate::websocket::{websocket_handler, SignalingState};

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/stats", get(stats))
        .route("/metrics", get(render_metrics))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve `state` on an already-bound listener until the future resolves.
pub async fn serve(
    listener: TcpListener,
    state: SharedState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}

pub async fn run(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let signaling = SignalingState::with_config(config.transport.clone());
    let sweeper = config
        .ring_timeout
        .map(|ttl| signaling.spawn_sweeper(ttl, config.sweep_interval));
    let state = AppState::new(signaling, metrics);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        listen_addr = %config.listen_addr,
        ring_timeout = ?config.ring_timeout,
        idle_timeout = ?config.transport.idle_timeout,
        "call-relay listening"
    );

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    if let Some(handle) = sweeper {
        handle.abort();
    }
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
