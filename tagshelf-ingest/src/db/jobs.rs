//! SQLite-backed job queue
//!
//! Jobs live in the catalog's `jobs` table. The partial unique index on
//! (kind, subject_id) over live states is what makes enqueue idempotent and
//! keeps two attempts for the same key from running at once; dequeue claims
//! a row with a single `UPDATE … RETURNING`, so concurrent workers never
//! share a job.

use crate::jobs::queue::{JobError, JobQueue};
use crate::jobs::retry::RetryPolicy;
use crate::jobs::types::{EnqueueRequest, Job, JobHandle, JobKind, JobState, QueueName};
use crate::utils::{begin_monitored, retry_on_lock};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tagshelf_common::db::init::DEFAULT_MAX_LOCK_WAIT_MS;
use tagshelf_common::events::{EventBus, IngestEvent};
use tagshelf_common::time::{parse_db_timestamp, to_db_timestamp};
use tagshelf_common::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const JOB_COLUMNS: &str = "guid, kind, subject_id, queue, payload, state, attempts, max_attempts, \
                           run_at, last_error, created_at, updated_at";

/// Enqueue attempts when the live job it would merge into finishes mid-race
const MAX_ENQUEUE_ROUNDS: usize = 3;

enum FailOutcome {
    Missing,
    WrongState(JobState),
    Retrying(Job),
    DeadLettered(Job),
}

/// [`JobQueue`] over the catalog database
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    retry: RetryPolicy,
    event_bus: Option<EventBus>,
    max_lock_wait_ms: u64,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self {
            pool,
            retry,
            event_bus: None,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    /// Broadcast dead-letter events on this bus
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_max_lock_wait_ms(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn live_job_id(&self, kind: JobKind, subject_id: &str) -> tagshelf_common::Result<Option<Uuid>> {
        let guid: Option<String> = sqlx::query_scalar(
            "SELECT guid FROM jobs WHERE kind = ? AND subject_id = ? \
             AND state IN ('pending', 'scheduled', 'active')",
        )
        .bind(kind.as_str())
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        guid.map(|g| parse_uuid(&g)).transpose()
    }

    async fn try_enqueue(&self, request: &EnqueueRequest) -> tagshelf_common::Result<JobHandle> {
        let now = Utc::now();
        let run_at = request.run_at.unwrap_or(now);
        let state = if run_at > now {
            JobState::Scheduled
        } else {
            JobState::Pending
        };
        let max_attempts = request.max_attempts.unwrap_or(self.retry.max_attempts).max(1);
        let payload = serde_json::to_string(&request.payload)?;

        for _ in 0..MAX_ENQUEUE_ROUNDS {
            let job_id = Uuid::new_v4();
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO jobs
                    (guid, kind, subject_id, queue, payload, state, attempts, max_attempts,
                     run_at, last_error, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, NULL, ?, ?)
                "#,
            )
            .bind(job_id.to_string())
            .bind(request.kind.as_str())
            .bind(&request.subject_id)
            .bind(request.queue().as_str())
            .bind(&payload)
            .bind(state.as_str())
            .bind(max_attempts as i64)
            .bind(to_db_timestamp(run_at))
            .bind(to_db_timestamp(now))
            .bind(to_db_timestamp(now))
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 1 {
                return Ok(JobHandle::accepted(job_id, request));
            }
            if let Some(existing) = self.live_job_id(request.kind, &request.subject_id).await? {
                return Ok(JobHandle::merged(existing, request));
            }
        }

        Err(Error::Internal(format!(
            "enqueue {}:{} did not settle after {} rounds",
            request.kind, request.subject_id, MAX_ENQUEUE_ROUNDS
        )))
    }

    async fn try_fail(
        &self,
        job_id: Uuid,
        retryable: bool,
        error: &str,
    ) -> tagshelf_common::Result<FailOutcome> {
        let mut tx = begin_monitored(&self.pool, "jobs::fail").await?;

        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE guid = ?", JOB_COLUMNS))
            .bind(job_id.to_string())
            .fetch_optional(&mut **tx.inner_mut()?)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(FailOutcome::Missing);
        };

        let mut job = job_from_row(&row)?;
        if job.state != JobState::Active {
            tx.rollback().await?;
            return Ok(FailOutcome::WrongState(job.state));
        }

        let now = Utc::now();
        if retryable && job.attempts < job.max_attempts {
            let delay = self.retry.delay(job.attempts, &mut rand::thread_rng());
            job.state = JobState::Scheduled;
            job.run_at = now + ChronoDuration::milliseconds(delay.as_millis() as i64);
        } else {
            job.state = JobState::DeadLetter;
        }
        job.last_error = Some(error.to_string());
        job.updated_at = now;

        sqlx::query(
            "UPDATE jobs SET state = ?, run_at = ?, last_error = ?, updated_at = ? WHERE guid = ?",
        )
        .bind(job.state.as_str())
        .bind(to_db_timestamp(job.run_at))
        .bind(&job.last_error)
        .bind(to_db_timestamp(now))
        .bind(job_id.to_string())
        .execute(&mut **tx.inner_mut()?)
        .await?;

        tx.commit().await?;

        Ok(match job.state {
            JobState::DeadLetter => FailOutcome::DeadLettered(job),
            _ => FailOutcome::Retrying(job),
        })
    }

    /// Error for an operation that matched no row in an expected state
    async fn state_error(&self, job_id: Uuid, expected: &'static str) -> JobError {
        match self.get(job_id).await {
            Ok(Some(job)) => JobError::InvalidState {
                id: job_id,
                state: job.state,
                expected,
            },
            Ok(None) => JobError::NotFound(job_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle, JobError> {
        let request_ref = &request;
        let handle = retry_on_lock("job enqueue", self.max_lock_wait_ms, move || {
            self.try_enqueue(request_ref)
        })
        .await?;

        if handle.accepted {
            info!(job_id = %handle.job_id, kind = %handle.kind, subject_id = %handle.subject_id, "Job enqueued");
        } else {
            debug!(job_id = %handle.job_id, kind = %handle.kind, subject_id = %handle.subject_id, "Enqueue merged into live job");
        }
        Ok(handle)
    }

    async fn dequeue(&self, queue: QueueName, kinds: &[JobKind]) -> Result<Option<Job>, JobError> {
        if kinds.is_empty() {
            return Ok(None);
        }

        let placeholders = vec!["?"; kinds.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE jobs SET state = 'active', attempts = attempts + 1, updated_at = ?
            WHERE guid = (
                SELECT guid FROM jobs
                WHERE queue = ? AND state IN ('pending', 'scheduled') AND run_at <= ?
                  AND kind IN ({})
                ORDER BY run_at, created_at
                LIMIT 1
            )
            AND state IN ('pending', 'scheduled')
            RETURNING {}
            "#,
            placeholders, JOB_COLUMNS
        );
        let now = to_db_timestamp(Utc::now());
        let (sql, now) = (sql.as_str(), now.as_str());

        let row = retry_on_lock("job dequeue", self.max_lock_wait_ms, move || async move {
            let mut query = sqlx::query(sql).bind(now).bind(queue.as_str()).bind(now);
            for kind in kinds {
                query = query.bind(kind.as_str());
            }
            Ok::<_, Error>(query.fetch_optional(&self.pool).await?)
        })
        .await?;

        row.map(|row| job_from_row(&row).map_err(JobError::from))
            .transpose()
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), JobError> {
        let now = to_db_timestamp(Utc::now());
        let id = job_id.to_string();
        let (now, id) = (now.as_str(), id.as_str());

        let updated = retry_on_lock("job complete", self.max_lock_wait_ms, move || async move {
            let result = sqlx::query(
                "UPDATE jobs SET state = 'completed', last_error = NULL, updated_at = ? \
                 WHERE guid = ? AND state = 'active'",
            )
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(self.state_error(job_id, "active").await);
        }
        debug!(job_id = %job_id, "Job completed");
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, retryable: bool, error: &str) -> Result<JobState, JobError> {
        let outcome = retry_on_lock("job fail", self.max_lock_wait_ms, move || {
            self.try_fail(job_id, retryable, error)
        })
        .await?;

        match outcome {
            FailOutcome::Missing => Err(JobError::NotFound(job_id)),
            FailOutcome::WrongState(state) => Err(JobError::InvalidState {
                id: job_id,
                state,
                expected: "active",
            }),
            FailOutcome::Retrying(job) => {
                info!(
                    job_id = %job_id,
                    kind = %job.kind,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    run_at = %job.run_at,
                    error,
                    "Job failed, retry scheduled"
                );
                Ok(job.state)
            }
            FailOutcome::DeadLettered(job) => {
                warn!(
                    job_id = %job_id,
                    kind = %job.kind,
                    subject_id = %job.subject_id,
                    attempts = job.attempts,
                    retryable,
                    error,
                    "Job dead-lettered"
                );
                if let Some(bus) = &self.event_bus {
                    bus.emit_lossy(IngestEvent::JobDeadLettered {
                        job_id,
                        kind: job.kind.to_string(),
                        subject_id: job.subject_id.clone(),
                        error: job.last_error.clone(),
                        timestamp: Utc::now(),
                    });
                }
                Ok(job.state)
            }
        }
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), JobError> {
        let now = to_db_timestamp(Utc::now());
        let id = job_id.to_string();
        let (now, id) = (now.as_str(), id.as_str());

        let updated = retry_on_lock("job cancel", self.max_lock_wait_ms, move || async move {
            let result = sqlx::query(
                "UPDATE jobs SET state = 'cancelled', updated_at = ? \
                 WHERE guid = ? AND state IN ('pending', 'scheduled')",
            )
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(self.state_error(job_id, "pending or scheduled").await);
        }
        info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE guid = ?", JOB_COLUMNS))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| job_from_row(&row)).transpose()?)
    }

    async fn list(&self, states: &[JobState]) -> Result<Vec<Job>, JobError> {
        let sql = if states.is_empty() {
            format!("SELECT {} FROM jobs ORDER BY created_at, guid", JOB_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM jobs WHERE state IN ({}) ORDER BY created_at, guid",
                JOB_COLUMNS,
                vec!["?"; states.len()].join(", ")
            )
        };

        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(job_from_row)
            .collect::<tagshelf_common::Result<Vec<_>>>()?)
    }

    async fn requeue_dead_letter(&self, job_id: Uuid) -> Result<Job, JobError> {
        let now = to_db_timestamp(Utc::now());
        let id = job_id.to_string();
        let (now, id) = (now.as_str(), id.as_str());

        let result = retry_on_lock("job requeue", self.max_lock_wait_ms, move || async move {
            let result = sqlx::query(
                "UPDATE jobs SET state = 'pending', attempts = 0, run_at = ?, updated_at = ? \
                 WHERE guid = ? AND state = 'dead_letter'",
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await;

        let updated = match result {
            Ok(updated) => updated,
            Err(e) if e.is_unique_violation() => {
                return Err(JobError::Conflict(format!(
                    "job {} shares its key with a live job",
                    job_id
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if updated == 0 {
            return Err(self.state_error(job_id, "dead_letter").await);
        }

        info!(job_id = %job_id, "Dead-lettered job requeued");
        self.get(job_id).await?.ok_or(JobError::NotFound(job_id))
    }

    async fn purge_dead_letter(&self) -> Result<u64, JobError> {
        let purged = retry_on_lock("dead-letter purge", self.max_lock_wait_ms, move || async move {
            let result = sqlx::query("DELETE FROM jobs WHERE state = 'dead_letter'")
                .execute(&self.pool)
                .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        info!(purged, "Dead-letter queue purged");
        Ok(purged)
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<u64, JobError> {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::milliseconds(older_than.as_millis() as i64);
        let (now, cutoff) = (to_db_timestamp(now), to_db_timestamp(cutoff));
        let (now, cutoff) = (now.as_str(), cutoff.as_str());

        let recovered = retry_on_lock("job recovery", self.max_lock_wait_ms, move || async move {
            let result = sqlx::query(
                "UPDATE jobs SET state = 'pending', updated_at = ? \
                 WHERE state = 'active' AND updated_at < ?",
            )
            .bind(now)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        if recovered > 0 {
            warn!(recovered, "Returned stale active jobs to the queue");
        }
        Ok(recovered)
    }
}

fn parse_uuid(value: &str) -> tagshelf_common::Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Invalid job id '{}': {}", value, e)))
}

fn parse_timestamp(row: &SqliteRow, column: &str) -> tagshelf_common::Result<DateTime<Utc>> {
    let value: String = row.get(column);
    parse_db_timestamp(&value)
}

fn job_from_row(row: &SqliteRow) -> tagshelf_common::Result<Job> {
    let guid: String = row.get("guid");
    let kind: String = row.get("kind");
    let queue: String = row.get("queue");
    let state: String = row.get("state");
    let payload: String = row.get("payload");
    let attempts: i64 = row.get("attempts");
    let max_attempts: i64 = row.get("max_attempts");

    Ok(Job {
        id: parse_uuid(&guid)?,
        kind: kind.parse().map_err(Error::Internal)?,
        subject_id: row.get("subject_id"),
        queue: queue.parse().map_err(Error::Internal)?,
        payload: serde_json::from_str(&payload)?,
        state: state.parse().map_err(Error::Internal)?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        run_at: parse_timestamp(row, "run_at")?,
        last_error: row.get("last_error"),
        created_at: parse_timestamp(row, "created_at")?,
        updated_at: parse_timestamp(row, "updated_at")?,
    })
}
