//! Operator HTTP API

pub mod capacity;
pub mod health;
pub mod jobs;

pub use capacity::capacity_routes;
pub use health::health_routes;
pub use jobs::job_routes;
