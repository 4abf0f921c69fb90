use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use crate::router::CallSnapshot;
use crate::websocket::SignalingState;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub signaling: SignalingState,
    /// Absent when no Prometheus recorder was installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(signaling: SignalingState, metrics: Option<PrometheusHandle>) -> SharedState {
        Arc::new(Self { signaling, metrics })
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: usize,
    pub registered_users: usize,
    pub calls: Vec<CallSnapshot>,
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn stats(State(state): State<SharedState>) -> Json<StatsResponse> {
    let snapshot = state.signaling.router.snapshot();
    Json(StatsResponse {
        connections: state.signaling.connections.len(),
        registered_users: snapshot.registered_users,
        calls: snapshot.calls,
    })
}

pub async fn render_metrics(State(state): State<SharedState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
