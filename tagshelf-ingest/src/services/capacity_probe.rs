//! Capacity probe
//!
//! Samples disk usage for each monitored path on an independent periodic
//! schedule and keeps a per-path status machine:
//!
//! - a successful sample resets the failure counter and classifies the path
//!   as `ok`, `warning` or `alert` against the configured thresholds
//! - a failed sample increments the counter and keeps the previous status
//!   until the counter exceeds `max_consecutive_failures`, then `unknown`
//!
//! Transitions are computed by the pure [`next_status`]; the probe only
//! samples, stores, persists and broadcasts. Probe failures never surface as
//! errors to callers.

use crate::config::CapacityConfig;
use crate::db::capacity::{load_statuses, upsert_status};
use crate::models::{CapacityLevel, CapacityStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::Disks;
use tagshelf_common::events::{EventBus, IngestEvent};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sampling errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Cannot sample {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    #[error("No mounted disk covers {0}")]
    NoDisk(PathBuf),

    #[error("Sampler task failed: {0}")]
    Task(String),
}

/// Disk usage source for one path
pub trait UsageSampler: Send + Sync {
    /// Used space of the filesystem holding `path`, in percent
    fn used_percent(&self, path: &Path) -> Result<f64, ProbeError>;
}

/// Samples usage from the mounted disk list
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoSampler;

impl UsageSampler for SysinfoSampler {
    fn used_percent(&self, path: &Path) -> Result<f64, ProbeError> {
        let canonical = path.canonicalize().map_err(|e| ProbeError::Unavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|disk| canonical.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .ok_or_else(|| ProbeError::NoDisk(path.to_path_buf()))?;

        let total = disk.total_space();
        if total == 0 {
            return Err(ProbeError::Unavailable {
                path: path.to_path_buf(),
                reason: format!("disk at {} reports zero size", disk.mount_point().display()),
            });
        }
        let used = total.saturating_sub(disk.available_space());
        Ok(used as f64 / total as f64 * 100.0)
    }
}

/// Result of one sampling attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Sample(f64),
    Failure(String),
}

/// Threshold classification of a successful sample
pub fn classify(used_percent: f64, config: &CapacityConfig) -> CapacityLevel {
    if used_percent >= config.alert_percent {
        CapacityLevel::Alert
    } else if used_percent >= config.warning_percent {
        CapacityLevel::Warning
    } else {
        CapacityLevel::Ok
    }
}

/// Status after applying one probe outcome to `previous`
pub fn next_status(
    previous: &CapacityStatus,
    outcome: &ProbeOutcome,
    config: &CapacityConfig,
    now: DateTime<Utc>,
) -> CapacityStatus {
    let mut next = previous.clone();
    next.last_probe_at = Some(now);
    next.next_probe_at = Some(now + ChronoDuration::seconds(config.probe_interval_secs as i64));

    match outcome {
        ProbeOutcome::Sample(used_percent) => {
            next.used_percent = Some(*used_percent);
            next.status = classify(*used_percent, config);
            next.consecutive_failures = 0;
            next.last_error = None;
        }
        ProbeOutcome::Failure(error) => {
            next.consecutive_failures = previous.consecutive_failures.saturating_add(1);
            next.last_error = Some(error.clone());
            if next.consecutive_failures > config.max_consecutive_failures {
                next.status = CapacityLevel::Unknown;
            }
        }
    }

    next
}

/// Per-path failure in a bulk probe
#[derive(Debug, Clone, Serialize)]
pub struct ProbeFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Bulk probe result: every status plus the paths whose sample failed
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkProbeReport {
    pub statuses: Vec<CapacityStatus>,
    pub errors: Vec<ProbeFailure>,
}

/// Periodic disk usage monitor
pub struct CapacityProbe {
    config: CapacityConfig,
    sampler: Arc<dyn UsageSampler>,
    statuses: RwLock<BTreeMap<PathBuf, CapacityStatus>>,
    catalog: Option<SqlitePool>,
    event_bus: Option<EventBus>,
}

impl CapacityProbe {
    pub fn new(config: CapacityConfig, sampler: Arc<dyn UsageSampler>) -> Self {
        let statuses = config
            .monitored_paths
            .iter()
            .map(|path| (path.clone(), CapacityStatus::unknown(path.clone())))
            .collect();

        Self {
            config,
            sampler,
            statuses: RwLock::new(statuses),
            catalog: None,
            event_bus: None,
        }
    }

    /// Persist statuses to the catalog after each probe
    pub fn with_catalog(mut self, pool: SqlitePool) -> Self {
        self.catalog = Some(pool);
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &CapacityConfig {
        &self.config
    }

    /// Restore persisted statuses for monitored paths
    pub async fn load_persisted(&self) -> tagshelf_common::Result<usize> {
        let Some(pool) = &self.catalog else {
            return Ok(0);
        };

        let stored = load_statuses(pool).await?;
        let mut statuses = self.statuses.write().await;
        let mut restored = 0;
        for status in stored {
            if let Some(slot) = statuses.get_mut(&status.path) {
                *slot = status;
                restored += 1;
            }
        }

        info!(restored, "Restored persisted capacity statuses");
        Ok(restored)
    }

    /// Sample one path now and apply the result
    pub async fn probe(&self, path: &Path) -> CapacityStatus {
        let outcome = self.sample(path).await;
        self.apply(path, outcome).await
    }

    /// Probe every monitored path
    pub async fn probe_all(&self) -> BulkProbeReport {
        let paths = self.config.monitored_paths.clone();
        self.probe_paths(&paths).await
    }

    /// Probe several paths concurrently; failures are collected per path
    pub async fn probe_paths(&self, paths: &[PathBuf]) -> BulkProbeReport {
        let outcomes = join_all(paths.iter().map(|path| async move {
            let outcome = self.sample(path).await;
            let error = match &outcome {
                ProbeOutcome::Failure(error) => Some(error.clone()),
                ProbeOutcome::Sample(_) => None,
            };
            (path.clone(), self.apply(path, outcome).await, error)
        }))
        .await;

        let mut report = BulkProbeReport::default();
        for (path, status, error) in outcomes {
            report.statuses.push(status);
            if let Some(error) = error {
                report.errors.push(ProbeFailure { path, error });
            }
        }
        report
    }

    async fn sample(&self, path: &Path) -> ProbeOutcome {
        let sampler = Arc::clone(&self.sampler);
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || sampler.used_percent(&owned)).await {
            Ok(Ok(used_percent)) => ProbeOutcome::Sample(used_percent),
            Ok(Err(e)) => ProbeOutcome::Failure(e.to_string()),
            Err(e) => ProbeOutcome::Failure(ProbeError::Task(e.to_string()).to_string()),
        }
    }

    async fn apply(&self, path: &Path, outcome: ProbeOutcome) -> CapacityStatus {
        let (previous, next) = {
            let mut statuses = self.statuses.write().await;
            let slot = statuses
                .entry(path.to_path_buf())
                .or_insert_with(|| CapacityStatus::unknown(path));
            let previous = slot.status;
            *slot = next_status(slot, &outcome, &self.config, Utc::now());
            (previous, slot.clone())
        };

        match &outcome {
            ProbeOutcome::Sample(used_percent) => {
                debug!(path = %path.display(), used_percent, status = %next.status, "Capacity sampled");
            }
            ProbeOutcome::Failure(error) => {
                warn!(
                    path = %path.display(),
                    error = %error,
                    consecutive_failures = next.consecutive_failures,
                    status = %next.status,
                    "Capacity probe failed"
                );
            }
        }

        if previous != next.status {
            info!(
                path = %path.display(),
                old_status = %previous,
                new_status = %next.status,
                "Capacity status changed"
            );
            if let Some(bus) = &self.event_bus {
                bus.emit_lossy(IngestEvent::CapacityStatusChanged {
                    path: path.to_string_lossy().to_string(),
                    old_status: previous.to_string(),
                    new_status: next.status.to_string(),
                    used_percent: next.used_percent,
                    timestamp: Utc::now(),
                });
            }
        }

        if let Some(pool) = &self.catalog {
            if let Err(e) = upsert_status(pool, &next).await {
                warn!(path = %path.display(), error = %e, "Failed to persist capacity status");
            }
        }

        next
    }

    /// Current status of one path
    pub async fn status(&self, path: &Path) -> Option<CapacityStatus> {
        self.statuses.read().await.get(path).cloned()
    }

    /// Every known status, ordered by path
    pub async fn statuses(&self) -> Vec<CapacityStatus> {
        self.statuses.read().await.values().cloned().collect()
    }

    /// True if any tracked path is alerting
    pub async fn any_alerting(&self) -> bool {
        self.statuses
            .read()
            .await
            .values()
            .any(|s| s.status == CapacityLevel::Alert)
    }

    /// True if any tracked path is in warning (alerting paths do not count)
    pub async fn any_warning(&self) -> bool {
        self.statuses
            .read()
            .await
            .values()
            .any(|s| s.status == CapacityLevel::Warning)
    }

    /// Status of the most specific tracked path containing `path`
    ///
    /// Both sides are compared in resolved form, so a path reached through a
    /// symlink or `..` still finds its monitored ancestor.
    pub async fn covering_status(&self, path: &Path) -> Option<CapacityStatus> {
        let target = resolve_path(path).await;
        let statuses: Vec<CapacityStatus> = self.statuses.read().await.values().cloned().collect();

        let mut best: Option<(usize, CapacityStatus)> = None;
        for status in statuses {
            let monitored = resolve_path(&status.path).await;
            if !target.starts_with(&monitored) && !path.starts_with(&status.path) {
                continue;
            }
            let depth = monitored.components().count();
            if best.as_ref().map_or(true, |(best_depth, _)| depth > *best_depth) {
                best = Some((depth, status));
            }
        }
        best.map(|(_, status)| status)
    }

    /// Run `probe_all` every probe interval until cancelled
    pub fn spawn_scheduler(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.probe_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), paths = self.config.monitored_paths.len(), "Capacity scheduler started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.probe_all().await;
                        debug!(probed = report.statuses.len(), failed = report.errors.len(), "Capacity probe cycle complete");
                    }
                }
            }

            info!("Capacity scheduler stopped");
        })
    }
}

/// Canonicalize the longest existing ancestor of `path` and re-append the
/// rest; falls back to `path` when nothing resolves
async fn resolve_path(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = tokio::fs::canonicalize(existing).await {
            return rest.iter().rev().fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}
