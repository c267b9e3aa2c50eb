//! Ingest event types and the broadcast event bus
//!
//! Events are broadcast via [`EventBus`] and serialize with a `type` tag so
//! collaborators (progress displays, operator tooling) can consume them as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events produced by the ingest core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// A scan run started walking its root
    ScanStarted {
        scan_id: String,
        root: String,
        timestamp: DateTime<Utc>,
    },

    /// A batch of scanned files was committed to the staging store
    ScanProgress {
        scan_id: String,
        /// Records committed so far (valid + invalid)
        files_committed: usize,
        /// Invalid records committed so far
        files_invalid: usize,
        timestamp: DateTime<Utc>,
    },

    /// A scan run finished (completed or cancelled)
    ScanCompleted {
        scan_id: String,
        files_valid: usize,
        files_invalid: usize,
        cancelled: bool,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A monitored path changed capacity status
    CapacityStatusChanged {
        path: String,
        old_status: String,
        new_status: String,
        used_percent: Option<f64>,
        timestamp: DateTime<Utc>,
    },

    /// A job exhausted its retries (or failed permanently) and was dead-lettered
    JobDeadLettered {
        job_id: Uuid,
        kind: String,
        subject_id: String,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl IngestEvent {
    /// Event type name as it appears in the serialized `type` tag
    pub fn event_type(&self) -> &str {
        match self {
            IngestEvent::ScanStarted { .. } => "ScanStarted",
            IngestEvent::ScanProgress { .. } => "ScanProgress",
            IngestEvent::ScanCompleted { .. } => "ScanCompleted",
            IngestEvent::CapacityStatusChanged { .. } => "CapacityStatusChanged",
            IngestEvent::JobDeadLettered { .. } => "JobDeadLettered",
        }
    }
}

/// Broadcast bus for [`IngestEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: IngestEvent,
    ) -> Result<usize, broadcast::error::SendError<IngestEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_started() -> IngestEvent {
        IngestEvent::ScanStarted {
            scan_id: "scan_20240101_000000_000".to_string(),
            root: "/music/inbound".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(16);
        assert_eq!(bus.capacity(), 16);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_emit_without_subscribers_fails_but_lossy_does_not_panic() {
        let bus = EventBus::new(4);
        assert!(bus.emit(scan_started()).is_err());
        bus.emit_lossy(scan_started());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_event() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.emit(scan_started()).unwrap(), 2);

        assert_eq!(rx1.recv().await.unwrap().event_type(), "ScanStarted");
        assert_eq!(rx2.recv().await.unwrap().event_type(), "ScanStarted");
    }

    #[test]
    fn test_serialized_tag_matches_event_type() {
        let event = IngestEvent::CapacityStatusChanged {
            path: "/srv/music".to_string(),
            old_status: "ok".to_string(),
            new_status: "alert".to_string(),
            used_percent: Some(91.0),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
        assert_eq!(json["new_status"], "alert");
    }
}
