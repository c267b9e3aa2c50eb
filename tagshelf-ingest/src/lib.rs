//! tagshelf-ingest library interface
//!
//! Exposes the ingest components and the operator router for the binary and
//! for integration tests.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use crate::jobs::JobQueue;
use crate::services::capacity_probe::CapacityProbe;
use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tagshelf_common::events::EventBus;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Catalog connection pool
    pub db: SqlitePool,
    pub queue: Arc<dyn JobQueue>,
    pub capacity: Arc<CapacityProbe>,
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        queue: Arc<dyn JobQueue>,
        capacity: Arc<CapacityProbe>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            db,
            queue,
            capacity,
            event_bus,
            startup_time: Utc::now(),
        }
    }
}

/// Build the operator router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::capacity_routes())
        .merge(api::job_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
