//! Capacity endpoints
//!
//! - `GET /capacity`: current status of every monitored path
//! - `POST /capacity/probe`: probe every monitored path now

use crate::models::CapacityStatus;
use crate::services::capacity_probe::BulkProbeReport;
use crate::AppState;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::info;

/// Capacity overview
#[derive(Debug, Serialize)]
pub struct CapacityResponse {
    pub statuses: Vec<CapacityStatus>,
    pub any_alerting: bool,
    /// Some path is warning and none is alerting
    pub any_warning: bool,
}

/// GET /capacity
pub async fn get_capacity(State(state): State<AppState>) -> Json<CapacityResponse> {
    Json(CapacityResponse {
        statuses: state.capacity.statuses().await,
        any_alerting: state.capacity.any_alerting().await,
        any_warning: state.capacity.any_warning().await,
    })
}

/// POST /capacity/probe
pub async fn probe_now(State(state): State<AppState>) -> Json<BulkProbeReport> {
    let report = state.capacity.probe_all().await;
    info!(
        paths = report.statuses.len(),
        errors = report.errors.len(),
        "Operator-triggered capacity probe"
    );
    Json(report)
}

/// Build capacity routes
pub fn capacity_routes() -> Router<AppState> {
    Router::new()
        .route("/capacity", get(get_capacity))
        .route("/capacity/probe", post(probe_now))
}
