//! Job and dead-letter endpoints
//!
//! - `GET /jobs?state=pending,active`: jobs filtered by state (all when omitted)
//! - `POST /jobs/:id/cancel`: cancel a pending or scheduled job
//! - `GET /dead-letter`: dead-lettered jobs
//! - `POST /dead-letter/:id/requeue`: return a dead-lettered job to pending
//! - `DELETE /dead-letter`: drop every dead-lettered job

use crate::jobs::{Job, JobState};
use crate::{ApiError, ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// `GET /jobs` query string
#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    /// Comma-separated job states
    pub state: Option<String>,
}

/// Parse a comma-separated state filter; blank entries are ignored
pub fn parse_states(filter: Option<&str>) -> Result<Vec<JobState>, ApiError> {
    filter
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<JobState>().map_err(ApiError::BadRequest))
        .collect()
}

/// GET /jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let states = parse_states(query.state.as_deref())?;
    Ok(Json(state.queue.list(&states).await?))
}

/// POST /jobs/:id/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    state.queue.cancel(id).await?;
    info!(job_id = %id, "Job cancelled by operator");

    let job = state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {}", id)))?;
    Ok(Json(job))
}

/// GET /dead-letter
pub async fn list_dead_letter(State(state): State<AppState>) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.queue.list(&[JobState::DeadLetter]).await?))
}

/// POST /dead-letter/:id/requeue
pub async fn requeue_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    let job = state.queue.requeue_dead_letter(id).await?;
    info!(job_id = %id, kind = %job.kind, "Dead-lettered job requeued");
    Ok(Json(job))
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged: u64,
}

/// DELETE /dead-letter
pub async fn purge_dead_letter(State(state): State<AppState>) -> ApiResult<Json<PurgeResponse>> {
    let purged = state.queue.purge_dead_letter().await?;
    info!(purged, "Dead-letter queue purged");
    Ok(Json(PurgeResponse { purged }))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route(
            "/dead-letter",
            get(list_dead_letter).delete(purge_dead_letter),
        )
        .route("/dead-letter/:id/requeue", post(requeue_dead_letter))
}
