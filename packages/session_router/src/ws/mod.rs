//! HTTP surface
//!
//! - `GET /ws`: WebSocket upgrade, one session per connection
//! - `GET /health`: liveness plus a few gauges
//! - `GET /metrics`: JSON snapshot of the server counters
//! - `GET /api/admin/stats`: row counts from the database

mod client;
mod handler;

pub use client::WsClientChannel;
pub use handler::handle_session_ws;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tracing::error;

use crate::backend::BackendHub;
use crate::config::AuthConfig;
use crate::db::Database;
use crate::metrics::{HealthStatus, MetricsSnapshot, ServerMetrics};
use crate::session::SessionServices;

#[derive(Clone)]
pub struct AppState {
    pub services: SessionServices,
    pub backend_hub: Arc<BackendHub>,
    pub auth_config: Arc<AuthConfig>,
    /// Same instance as `services.metrics`
    pub metrics: Arc<ServerMetrics>,
    pub db: Arc<Database>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(session_websocket_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/admin/stats", get(stats_handler))
        .with_state(state)
}

/// The caller's identity, as stamped on the request by the fronting proxy.
fn user_id_from_headers(headers: &HeaderMap, header: &str) -> Option<String> {
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

pub async fn session_websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = user_id_from_headers(&headers, &state.auth_config.user_header);
    ws.on_upgrade(move |socket| handle_session_ws(socket, state, user_id))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthStatus> {
    let snapshot = state.metrics.snapshot();
    Json(HealthStatus {
        status: "ok".to_string(),
        connections: snapshot.connections.active,
        backend_topics: state.backend_hub.topic_count() as u64,
        uptime_secs: snapshot.uptime_secs,
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn stats_handler(State(state): State<AppState>) -> Response {
    match state.db.get_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!("Failed to read database stats: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
