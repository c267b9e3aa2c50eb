//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while a monitored path is alerting
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub capacity_alerting: bool,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;
    let capacity_alerting = state.capacity.any_alerting().await;

    Json(HealthResponse {
        status: if capacity_alerting { "degraded" } else { "ok" }.to_string(),
        module: "tagshelf-ingest".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        capacity_alerting,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
