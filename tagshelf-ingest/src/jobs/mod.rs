//! Job orchestration
//!
//! - `types`: job records, kinds, queues, states
//! - `retry`: backoff policy
//! - `queue`: the `JobQueue` contract (SQLite implementation in `db::jobs`)
//! - `worker`: handler trait and per-queue worker groups
//! - `admission`: capacity gate for placement work
//! - `handlers`: built-in `process` and `move` handlers

pub mod admission;
pub mod handlers;
pub mod queue;
pub mod retry;
pub mod types;
pub mod worker;

pub use admission::{Admission, PlacementGate};
pub use handlers::{MoveHandler, MovePayload, ProcessHandler, ProcessPayload};
pub use queue::{JobError, JobQueue};
pub use retry::RetryPolicy;
pub use types::{EnqueueRequest, Job, JobHandle, JobKind, JobState, QueueName};
pub use worker::{spawn_worker_pool, HandlerRegistry, JobFailure, JobHandler, RunOutcome, WorkerGroup};
