//! Worker groups
//!
//! Each queue gets its own group of independent tokio tasks. A worker claims
//! one job at a time for the kinds it has handlers for, runs the handler and
//! reports the outcome back to the queue.

use super::queue::{JobError, JobQueue};
use super::types::{Job, JobKind, JobState, QueueName};
use crate::config::QueueWorkers;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handler failure; non-retryable failures dead-letter immediately
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub retryable: bool,
    pub message: String,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Executes one job kind
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn handle(&self, job: &Job) -> Result<(), JobFailure>;
}

/// Handlers by kind
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for its kind
    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&kind)
    }

    /// Registered kinds in a stable order
    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }
}

/// What happened to one claimed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub job_id: Uuid,
    pub kind: JobKind,
    /// State after the attempt: completed, scheduled or dead_letter
    pub state: JobState,
}

/// Workers for one queue
pub struct WorkerGroup {
    queue: QueueName,
    job_queue: Arc<dyn JobQueue>,
    handlers: Arc<HandlerRegistry>,
    kinds: Vec<JobKind>,
    poll_interval: Duration,
}

impl WorkerGroup {
    pub fn new(
        queue: QueueName,
        job_queue: Arc<dyn JobQueue>,
        handlers: Arc<HandlerRegistry>,
        poll_interval: Duration,
    ) -> Self {
        let kinds = handlers.kinds();
        Self {
            queue,
            job_queue,
            handlers,
            kinds,
            poll_interval,
        }
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Claim and run at most one job; `None` when nothing was due
    pub async fn run_once(&self) -> Result<Option<RunOutcome>, JobError> {
        let Some(job) = self.job_queue.dequeue(self.queue, &self.kinds).await? else {
            return Ok(None);
        };

        debug!(
            job_id = %job.id,
            kind = %job.kind,
            queue = %self.queue,
            attempt = job.attempts,
            "Running job"
        );

        let result = match self.handlers.get(job.kind) {
            Some(handler) => handler.handle(&job).await,
            None => Err(JobFailure::permanent(format!("no handler for {}", job.kind))),
        };

        let state = match result {
            Ok(()) => {
                self.job_queue.complete(job.id).await?;
                JobState::Completed
            }
            Err(failure) => {
                warn!(
                    job_id = %job.id,
                    kind = %job.kind,
                    retryable = failure.retryable,
                    error = %failure,
                    "Job attempt failed"
                );
                self.job_queue
                    .fail(job.id, failure.retryable, &failure.message)
                    .await?
            }
        };

        Ok(Some(RunOutcome {
            job_id: job.id,
            kind: job.kind,
            state,
        }))
    }

    /// Spawn `workers` tasks polling this queue until cancelled
    pub fn spawn(self: Arc<Self>, workers: usize, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        if self.kinds.is_empty() || workers == 0 {
            return Vec::new();
        }

        info!(queue = %self.queue, workers, kinds = ?self.kinds, "Starting worker group");
        (0..workers)
            .map(|worker_id| {
                let group = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move { group.run_worker(worker_id, cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker_id: usize, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    warn!(queue = %self.queue, worker_id, error = %e, "Worker poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        debug!(queue = %self.queue, worker_id, "Worker exiting");
    }
}

/// Spawn one worker group per queue with the configured worker counts
pub fn spawn_worker_pool(
    workers: &QueueWorkers,
    job_queue: Arc<dyn JobQueue>,
    handlers: Arc<HandlerRegistry>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    QueueName::ALL
        .into_iter()
        .flat_map(|queue| {
            let count = match queue {
                QueueName::Critical => workers.critical,
                QueueName::Default => workers.default,
                QueueName::Bulk => workers.bulk,
                QueueName::Maintenance => workers.maintenance,
            };
            let group = Arc::new(WorkerGroup::new(
                queue,
                Arc::clone(&job_queue),
                Arc::clone(&handlers),
                poll_interval,
            ));
            group.spawn(count, cancel.clone())
        })
        .collect()
}
