//! Job records and enqueue requests

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Work produced by the ingest pipeline
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Scan,
    TagEnrich,
    Index,
    Transcode,
    Process,
    Move,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Scan,
        JobKind::TagEnrich,
        JobKind::Index,
        JobKind::Transcode,
        JobKind::Process,
        JobKind::Move,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scan => "scan",
            JobKind::TagEnrich => "tag_enrich",
            JobKind::Index => "index",
            JobKind::Transcode => "transcode",
            JobKind::Process => "process",
            JobKind::Move => "move",
        }
    }

    /// Queue a kind is routed to unless the request names one
    pub fn default_queue(&self) -> QueueName {
        match self {
            JobKind::Scan => QueueName::Critical,
            JobKind::Process | JobKind::Move | JobKind::TagEnrich => QueueName::Default,
            JobKind::Transcode => QueueName::Bulk,
            JobKind::Index => QueueName::Maintenance,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown job kind '{}'", s))
    }
}

/// Priority queues, each consumed by its own worker group
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Critical,
    Default,
    Bulk,
    Maintenance,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Critical,
        QueueName::Default,
        QueueName::Bulk,
        QueueName::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Critical => "critical",
            QueueName::Default => "default",
            QueueName::Bulk => "bulk",
            QueueName::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|queue| queue.as_str() == s)
            .ok_or_else(|| format!("unknown queue '{}'", s))
    }
}

/// Job lifecycle
///
/// `pending`/`scheduled`/`active` are live: at most one live job exists per
/// (kind, subject id). `completed`, `cancelled` and `dead_letter` are
/// terminal and retained for inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Scheduled,
    Active,
    Completed,
    Cancelled,
    DeadLetter,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Scheduled,
        JobState::Active,
        JobState::Completed,
        JobState::Cancelled,
        JobState::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Scheduled => "scheduled",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::DeadLetter => "dead_letter",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Scheduled | JobState::Active)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{}'", s))
    }
}

/// One unit of queued work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    /// Idempotency key together with `kind`
    pub subject_id: String,
    pub queue: QueueName,
    pub payload: Value,
    pub state: JobState,
    /// Attempts started so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the payload into a handler's payload type
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Producer-side request to enqueue work
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub kind: JobKind,
    pub subject_id: String,
    pub payload: Value,
    /// Overrides [`JobKind::default_queue`]
    #[serde(default)]
    pub queue: Option<QueueName>,
    /// Earliest start; `None` means now
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    /// Overrides the retry policy's max attempts
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(
        kind: JobKind,
        subject_id: impl Into<String>,
        payload: &impl Serialize,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            subject_id: subject_id.into(),
            payload: serde_json::to_value(payload)?,
            queue: None,
            run_at: None,
            max_attempts: None,
        })
    }

    pub fn with_queue(mut self, queue: QueueName) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn queue(&self) -> QueueName {
        self.queue.unwrap_or_else(|| self.kind.default_queue())
    }
}

/// Result of an enqueue: a new job, or the live job it merged into
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub subject_id: String,
    pub accepted: bool,
    pub merged_into: Option<Uuid>,
}

impl JobHandle {
    pub fn accepted(job_id: Uuid, request: &EnqueueRequest) -> Self {
        Self {
            job_id,
            kind: request.kind,
            subject_id: request.subject_id.clone(),
            accepted: true,
            merged_into: None,
        }
    }

    pub fn merged(existing: Uuid, request: &EnqueueRequest) -> Self {
        Self {
            job_id: existing,
            kind: request.kind,
            subject_id: request.subject_id.clone(),
            accepted: false,
            merged_into: Some(existing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_forms_round_trip_through_parse() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("exploded".parse::<JobState>().is_err());
    }

    #[test]
    fn test_serde_matches_stored_strings() {
        assert_eq!(serde_json::to_string(&JobState::DeadLetter).unwrap(), "\"dead_letter\"");
        assert_eq!(serde_json::to_string(&JobKind::TagEnrich).unwrap(), "\"tag_enrich\"");
    }

    #[test]
    fn test_live_states() {
        let live: Vec<_> = JobState::ALL.into_iter().filter(JobState::is_live).collect();
        assert_eq!(live, vec![JobState::Pending, JobState::Scheduled, JobState::Active]);
    }

    #[test]
    fn test_request_queue_routing() {
        let request = EnqueueRequest::new(JobKind::Move, "abc", &serde_json::json!({})).unwrap();
        assert_eq!(request.queue(), QueueName::Default);
        assert_eq!(request.with_queue(QueueName::Critical).queue(), QueueName::Critical);
        assert_eq!(JobKind::Scan.default_queue(), QueueName::Critical);
    }
}
