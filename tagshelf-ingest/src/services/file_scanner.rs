//! Audio file scanner
//!
//! Populates a staging store with one [`ScannedFile`] per recognized media
//! file under a root:
//!
//! - one sequential walker (blocking thread) feeds a bounded channel of paths
//! - a fixed pool of workers fingerprints files on the blocking pool and
//!   sends records into a second bounded channel
//! - a single batching inserter commits fixed-size batches transactionally
//!
//! A stalled inserter blocks the workers, which block the walker. Per-file
//! problems become invalid records; only root validation and staging store
//! failures abort a run. Cancellation stops the walk, and every record
//! already produced is still committed.

use crate::config::ScannerConfig;
use crate::db::staging::StagingStore;
use crate::models::ScannedFile;
use crate::services::fingerprinter::{is_media_file, ContentFingerprinter};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tagshelf_common::events::{EventBus, IngestEvent};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

/// Audio file scanner errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// Specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Path exists but is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Staging store write failed
    #[error("Staging store error: {0}")]
    Staging(#[from] tagshelf_common::Error),

    /// A scanner task panicked or was aborted
    #[error("Scanner task failed: {0}")]
    Task(String),
}

/// Aggregate statistics for one scan run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStatistics {
    pub scan_id: String,
    pub root: PathBuf,
    /// Media files handed to the workers
    pub files_discovered: usize,
    pub files_valid: usize,
    pub files_invalid: usize,
    pub bytes_hashed: u64,
    pub batches_committed: usize,
    /// Directory entries the walker could not read
    pub walk_errors: usize,
    pub elapsed_ms: u64,
    pub files_per_second: f64,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct WalkSummary {
    discovered: usize,
    walk_errors: usize,
}

/// Parallel scanner writing into a [`StagingStore`]
#[derive(Clone)]
pub struct FileScanner {
    config: ScannerConfig,
    fingerprinter: ContentFingerprinter,
    event_bus: Option<EventBus>,
}

impl FileScanner {
    pub fn new(config: ScannerConfig, fingerprinter: ContentFingerprinter) -> Self {
        Self {
            config,
            fingerprinter,
            event_bus: None,
        }
    }

    /// Broadcast scan progress on this bus
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Scan `root` into `store`
    pub async fn scan(
        &self,
        root: &Path,
        store: &StagingStore,
        cancel: CancellationToken,
    ) -> Result<ScanStatistics, ScanError> {
        if !root.exists() {
            return Err(ScanError::PathNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }

        let started = Instant::now();
        let scan_id = store.scan_id().to_string();
        tracing::info!(scan_id = %scan_id, root = %root.display(), workers = self.config.workers, "Scan started");
        self.emit(IngestEvent::ScanStarted {
            scan_id: scan_id.clone(),
            root: root.to_string_lossy().to_string(),
            timestamp: Utc::now(),
        });

        let (work_tx, work_rx) = mpsc::channel::<PathBuf>(self.config.work_queue_capacity);
        let (result_tx, mut result_rx) =
            mpsc::channel::<ScannedFile>(self.config.result_queue_capacity);

        let walker = {
            let root = root.to_path_buf();
            let ignore_patterns = self.config.ignore_patterns.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || walk(&root, &ignore_patterns, work_tx, &cancel))
        };

        let work_rx = Arc::new(Mutex::new(work_rx));
        let workers: Vec<_> = (0..self.config.workers)
            .map(|worker_id| {
                let work_rx = Arc::clone(&work_rx);
                let result_tx = result_tx.clone();
                let fingerprinter = self.fingerprinter.clone();
                let cancel = cancel.clone();
                tokio::spawn(run_worker(worker_id, work_rx, result_tx, fingerprinter, cancel))
            })
            .collect();
        drop(result_tx);

        // Batching inserter: runs until every worker has dropped its sender
        let mut stats = ScanStatistics {
            scan_id: scan_id.clone(),
            root: root.to_path_buf(),
            ..Default::default()
        };
        let mut batch = Vec::with_capacity(self.config.batch_size);
        while let Some(record) = result_rx.recv().await {
            batch.push(record);
            if batch.len() >= self.config.batch_size {
                self.commit_batch(store, &mut batch, &mut stats).await?;
            }
        }
        self.commit_batch(store, &mut batch, &mut stats).await?;

        for worker in workers {
            worker
                .await
                .map_err(|e| ScanError::Task(format!("worker: {}", e)))?;
        }
        let walk_summary = walker
            .await
            .map_err(|e| ScanError::Task(format!("walker: {}", e)))?;

        let elapsed = started.elapsed();
        let committed = stats.files_valid + stats.files_invalid;
        stats.files_discovered = walk_summary.discovered;
        stats.walk_errors = walk_summary.walk_errors;
        stats.elapsed_ms = elapsed.as_millis() as u64;
        stats.files_per_second = if elapsed.as_secs_f64() > 0.0 {
            committed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        stats.cancelled = cancel.is_cancelled();

        store.record_completion(root, &stats).await?;

        tracing::info!(
            scan_id = %scan_id,
            valid = stats.files_valid,
            invalid = stats.files_invalid,
            walk_errors = stats.walk_errors,
            elapsed_ms = stats.elapsed_ms,
            files_per_second = stats.files_per_second,
            cancelled = stats.cancelled,
            "Scan finished"
        );
        self.emit(IngestEvent::ScanCompleted {
            scan_id,
            files_valid: stats.files_valid,
            files_invalid: stats.files_invalid,
            cancelled: stats.cancelled,
            elapsed_ms: stats.elapsed_ms,
            timestamp: Utc::now(),
        });

        Ok(stats)
    }

    async fn commit_batch(
        &self,
        store: &StagingStore,
        batch: &mut Vec<ScannedFile>,
        stats: &mut ScanStatistics,
    ) -> Result<(), ScanError> {
        if batch.is_empty() {
            return Ok(());
        }

        store.insert_batch(batch).await?;

        for record in batch.iter() {
            if record.is_valid {
                stats.files_valid += 1;
            } else {
                stats.files_invalid += 1;
            }
            if record.content_hash.is_some() {
                stats.bytes_hashed += record.size;
            }
        }
        stats.batches_committed += 1;
        batch.clear();

        tracing::debug!(
            scan_id = %stats.scan_id,
            batches = stats.batches_committed,
            committed = stats.files_valid + stats.files_invalid,
            "Staging batch committed"
        );
        self.emit(IngestEvent::ScanProgress {
            scan_id: stats.scan_id.clone(),
            files_committed: stats.files_valid + stats.files_invalid,
            files_invalid: stats.files_invalid,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn emit(&self, event: IngestEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(event);
        }
    }
}

async fn run_worker(
    worker_id: usize,
    work_rx: Arc<Mutex<mpsc::Receiver<PathBuf>>>,
    result_tx: mpsc::Sender<ScannedFile>,
    fingerprinter: ContentFingerprinter,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let next = { work_rx.lock().await.recv().await };
        let Some(path) = next else {
            break;
        };

        let fp = fingerprinter.clone();
        let task_path = path.clone();
        let record = match tokio::task::spawn_blocking(move || fp.fingerprint(&task_path)).await {
            Ok(record) => record,
            Err(e) => ScannedFile::invalid(path, format!("fingerprint task failed: {}", e)),
        };

        if result_tx.send(record).await.is_err() {
            // Inserter gone (staging failure); stop taking work
            break;
        }
    }
    tracing::trace!(worker_id, "Scan worker exiting");
}

/// Sequential directory walk; runs on a blocking thread
fn walk(
    root: &Path,
    ignore_patterns: &[String],
    work_tx: mpsc::Sender<PathBuf>,
    cancel: &CancellationToken,
) -> WalkSummary {
    let mut summary = WalkSummary::default();
    let mut symlink_visited = HashSet::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| should_process_entry(entry, ignore_patterns, &mut symlink_visited));

    for entry in walker {
        if cancel.is_cancelled() {
            tracing::info!(root = %root.display(), "Scan cancelled, stopping walk");
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                summary.walk_errors += 1;
                tracing::warn!(error = %e, "Error accessing entry");
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_media_file(entry.path()) {
            continue;
        }

        if work_tx.blocking_send(entry.into_path()).is_err() {
            break;
        }
        summary.discovered += 1;
    }

    summary
}

fn should_process_entry(
    entry: &DirEntry,
    ignore_patterns: &[String],
    symlink_visited: &mut HashSet<PathBuf>,
) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    if entry.depth() > 0 && ignore_patterns.iter().any(|pattern| file_name == pattern.as_str()) {
        return false;
    }

    if entry.path_is_symlink() {
        match entry.path().canonicalize() {
            Ok(canonical) => {
                if !symlink_visited.insert(canonical) {
                    tracing::warn!(path = %entry.path().display(), "Symlink loop detected");
                    return false;
                }
            }
            Err(_) => return false,
        }
    }

    true
}
