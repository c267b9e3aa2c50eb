//! Job queue contract
//!
//! Delivery is at-least-once: a handler may see the same job again after a
//! crash or retry, and the idempotency key (kind, subject id) keeps redelivery
//! from fanning out into duplicate live jobs.

use super::types::{EnqueueRequest, Job, JobHandle, JobKind, JobState, QueueName};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Job queue errors
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    /// The job is not in a state the operation applies to
    #[error("Job {id} is {state}, expected {expected}")]
    InvalidState {
        id: Uuid,
        state: JobState,
        expected: &'static str,
    },

    /// Another live job already holds the idempotency key
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Database(#[from] tagshelf_common::Error),

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        JobError::Database(err.into())
    }
}

/// Priority job queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue, merging into the live job holding the same key if one exists
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle, JobError>;

    /// Claim the oldest due job of the given kinds in a queue
    async fn dequeue(&self, queue: QueueName, kinds: &[JobKind]) -> Result<Option<Job>, JobError>;

    /// Mark an active job completed
    async fn complete(&self, job_id: Uuid) -> Result<(), JobError>;

    /// Record a failed attempt; returns the resulting state
    /// (`scheduled` for a retry, `dead_letter` otherwise)
    async fn fail(&self, job_id: Uuid, retryable: bool, error: &str) -> Result<JobState, JobError>;

    /// Cancel a job that has not started
    async fn cancel(&self, job_id: Uuid) -> Result<(), JobError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobError>;

    /// Jobs in any of `states` (all jobs when empty), oldest first
    async fn list(&self, states: &[JobState]) -> Result<Vec<Job>, JobError>;

    /// Move a dead-lettered job back to pending with a fresh attempt budget
    async fn requeue_dead_letter(&self, job_id: Uuid) -> Result<Job, JobError>;

    /// Delete every dead-lettered job; returns the number removed
    async fn purge_dead_letter(&self) -> Result<u64, JobError>;

    /// Return active jobs untouched for `older_than` to pending
    async fn recover_stale(&self, older_than: Duration) -> Result<u64, JobError>;
}
