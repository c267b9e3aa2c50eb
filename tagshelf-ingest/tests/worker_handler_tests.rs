//! Worker groups running the built-in process and move handlers

mod helpers;

use async_trait::async_trait;
use helpers::{scanner_config, tag_reader, test_catalog, write_track, FixedSampler, TestCatalog, Track};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tagshelf_ingest::config::CapacityConfig;
use tagshelf_ingest::db::staging::StagingStore;
use tagshelf_ingest::db::SqliteJobQueue;
use tagshelf_ingest::jobs::{
    EnqueueRequest, HandlerRegistry, Job, JobFailure, JobHandler, JobKind, JobQueue, JobState,
    MoveHandler, MovePayload, PlacementGate, ProcessHandler, ProcessPayload, QueueName,
    RetryPolicy, WorkerGroup,
};
use tagshelf_ingest::models::AlbumGroup;
use tagshelf_ingest::services::album_grouping::AlbumGroupingEngine;
use tagshelf_ingest::services::capacity_probe::CapacityProbe;
use tagshelf_ingest::services::file_scanner::FileScanner;
use tagshelf_ingest::services::fingerprinter::ContentFingerprinter;
use tagshelf_ingest::services::sidecar::{read_sidecar, SidecarArtist, SIDECAR_FILE_NAME};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Handler that fails a set number of times before succeeding
struct FlakyHandler {
    failures: usize,
    retryable: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    fn kind(&self) -> JobKind {
        JobKind::TagEnrich
    }

    async fn handle(&self, _job: &Job) -> Result<(), JobFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(if self.retryable {
                JobFailure::retryable("upstream busy")
            } else {
                JobFailure::permanent("bad input")
            });
        }
        Ok(())
    }
}

fn queue(catalog: &TestCatalog) -> Arc<SqliteJobQueue> {
    Arc::new(SqliteJobQueue::new(
        catalog.pool.clone(),
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 0,
            ..Default::default()
        },
    ))
}

fn group(queue: Arc<SqliteJobQueue>, handlers: HandlerRegistry) -> WorkerGroup {
    WorkerGroup::new(
        QueueName::Default,
        queue,
        Arc::new(handlers),
        Duration::from_millis(10),
    )
}

#[tokio::test]
async fn test_run_once_retries_until_success() {
    let catalog = test_catalog().await;
    let queue = queue(&catalog);
    let handler = Arc::new(FlakyHandler {
        failures: 2,
        retryable: true,
        calls: AtomicUsize::new(0),
    });
    let workers = group(queue.clone(), HandlerRegistry::new().register(handler.clone()));

    assert!(workers.run_once().await.unwrap().is_none());

    let handle = queue
        .enqueue(EnqueueRequest::new(JobKind::TagEnrich, "track-1", &json!({})).unwrap())
        .await
        .unwrap();

    let states: Vec<JobState> = [
        workers.run_once().await.unwrap().unwrap(),
        workers.run_once().await.unwrap().unwrap(),
        workers.run_once().await.unwrap().unwrap(),
    ]
    .into_iter()
    .map(|outcome| {
        assert_eq!(outcome.job_id, handle.job_id);
        outcome.state
    })
    .collect();

    assert_eq!(
        states,
        vec![JobState::Scheduled, JobState::Scheduled, JobState::Completed]
    );
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    let job = queue.get(handle.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 3);
}

#[tokio::test]
async fn test_permanent_failure_dead_letters_on_first_attempt() {
    let catalog = test_catalog().await;
    let queue = queue(&catalog);
    let handler = Arc::new(FlakyHandler {
        failures: 1,
        retryable: false,
        calls: AtomicUsize::new(0),
    });
    let workers = group(queue.clone(), HandlerRegistry::new().register(handler));

    queue
        .enqueue(EnqueueRequest::new(JobKind::TagEnrich, "track-2", &json!({})).unwrap())
        .await
        .unwrap();
    let outcome = workers.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.state, JobState::DeadLetter);
    assert!(workers.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_worker_ignores_kinds_without_handlers() {
    let catalog = test_catalog().await;
    let queue = queue(&catalog);
    let workers = group(queue.clone(), HandlerRegistry::new().register(Arc::new(ProcessHandler)));

    let handle = queue
        .enqueue(EnqueueRequest::new(JobKind::TagEnrich, "t", &json!({})).unwrap())
        .await
        .unwrap();

    assert!(workers.run_once().await.unwrap().is_none());
    assert_eq!(
        queue.get(handle.job_id).await.unwrap().unwrap().state,
        JobState::Pending
    );
}

#[tokio::test]
async fn test_spawned_workers_drain_the_queue_and_stop_on_cancel() {
    let catalog = test_catalog().await;
    let queue = queue(&catalog);
    let handler = Arc::new(FlakyHandler {
        failures: 0,
        retryable: true,
        calls: AtomicUsize::new(0),
    });
    for i in 0..6 {
        queue
            .enqueue(EnqueueRequest::new(JobKind::TagEnrich, format!("t{}", i), &json!({})).unwrap())
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    let handles = Arc::new(group(queue.clone(), HandlerRegistry::new().register(handler.clone())))
        .spawn(3, cancel.clone());
    assert_eq!(handles.len(), 3);

    for _ in 0..200 {
        if queue.list(&[JobState::Completed]).await.unwrap().len() == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(queue.list(&[JobState::Completed]).await.unwrap().len(), 6);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 6);
}

/// Staged album ready for the process and move handlers
struct StagedAlbum {
    _inbound: TempDir,
    work: TempDir,
    staging_db: PathBuf,
    group: AlbumGroup,
}

impl StagedAlbum {
    fn staging_dir(&self) -> PathBuf {
        self.work.path().join("staging").join("LZ").join("Physical_Graffiti")
    }

    fn library_root(&self) -> PathBuf {
        self.work.path().join("library")
    }

    fn target_dir(&self) -> PathBuf {
        self.library_root().join("LZ").join("Led_Zeppelin").join("Physical_Graffiti")
    }
}

async fn staged_album() -> StagedAlbum {
    stage(|inbound| {
        for track in 1..=3 {
            let mut tags = Track::new("Led Zeppelin", "Physical Graffiti", track, Some(1975));
            tags.genre = Some("Rock");
            write_track(inbound, &format!("{:02}.flac", track), &tags);
        }
    })
    .await
}

/// Scan and group whatever `write` puts in a fresh inbound directory
async fn stage(write: impl FnOnce(&Path)) -> StagedAlbum {
    let inbound = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    write(inbound.path());

    let store = StagingStore::create(work.path(), "scan_handlers").await.unwrap();
    FileScanner::new(scanner_config(), ContentFingerprinter::new(tag_reader()))
        .scan(inbound.path(), &store, CancellationToken::new())
        .await
        .unwrap();
    AlbumGroupingEngine::default().run(&store).await.unwrap();
    let group = store.album_groups().await.unwrap().remove(0);
    let staging_db = store.path().to_path_buf();
    store.close().await;

    StagedAlbum {
        _inbound: inbound,
        work,
        staging_db,
        group,
    }
}

fn process_request(album: &StagedAlbum) -> EnqueueRequest {
    let payload = ProcessPayload {
        scan_id: "scan_handlers".to_string(),
        staging_db: album.staging_db.clone(),
        group_id: album.group.group_id.clone(),
        staging_dir: album.staging_dir(),
        artist: SidecarArtist {
            name: "Led Zeppelin".to_string(),
            name_normalized: "led zeppelin".to_string(),
            directory_code: "LZ".to_string(),
        },
    };
    EnqueueRequest::new(JobKind::Process, &album.group.group_hash, &payload).unwrap()
}

fn move_request(album: &StagedAlbum) -> EnqueueRequest {
    let payload = MovePayload {
        staging_db: album.staging_db.clone(),
        group_id: album.group.group_id.clone(),
        library: "main".to_string(),
        library_root: album.library_root(),
        staging_dir: album.staging_dir(),
        target_dir: album.target_dir(),
    };
    EnqueueRequest::new(JobKind::Move, &album.group.group_hash, &payload).unwrap()
}

fn gate(monitored: &[&Path], sampler: Arc<FixedSampler>) -> (Arc<CapacityProbe>, PlacementGate) {
    let config = CapacityConfig {
        monitored_paths: monitored.iter().map(|p| p.to_path_buf()).collect(),
        ..Default::default()
    };
    let probe = Arc::new(CapacityProbe::new(config, sampler));
    let gate = PlacementGate::new(Arc::clone(&probe));
    (probe, gate)
}

#[tokio::test]
async fn test_process_then_move_places_album() {
    let catalog = test_catalog().await;
    let queue = queue(&catalog);
    let album = staged_album().await;
    let (_probe, gate) = gate(&[], FixedSampler::new());
    let workers = group(
        queue.clone(),
        HandlerRegistry::new()
            .register(Arc::new(ProcessHandler))
            .register(Arc::new(MoveHandler::new(gate))),
    );

    queue.enqueue(process_request(&album)).await.unwrap();
    let outcome = workers.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.kind, JobKind::Process);
    assert_eq!(outcome.state, JobState::Completed);

    let sidecar = read_sidecar(&album.staging_dir()).await.unwrap().unwrap();
    assert_eq!(sidecar.scan_id, "scan_handlers");
    assert_eq!(sidecar.artist.directory_code, "LZ");
    assert_eq!(sidecar.album.year, Some(1975));
    assert_eq!(sidecar.album.genres, vec!["Rock".to_string()]);
    assert_eq!(sidecar.tracks.len(), 3);
    assert!(sidecar.validation.is_valid);

    queue.enqueue(move_request(&album)).await.unwrap();
    let outcome = workers.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.kind, JobKind::Move);
    assert_eq!(outcome.state, JobState::Completed);

    let target = album.target_dir();
    for name in ["01.flac", "02.flac", "03.flac"] {
        assert!(target.join(name).is_file(), "{} not placed", name);
    }
    assert!(target.join(SIDECAR_FILE_NAME).is_file());
    let leftovers: Vec<_> = std::fs::read_dir(&target)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_handlers_are_idempotent_on_redelivery() {
    let catalog = test_catalog().await;
    let queue = queue(&catalog);
    let album = staged_album().await;
    let (_probe, gate) = gate(&[], FixedSampler::new());
    let process = ProcessHandler;
    let mover = MoveHandler::new(gate);

    queue.enqueue(process_request(&album)).await.unwrap();
    let job = queue
        .dequeue(QueueName::Default, &[JobKind::Process])
        .await
        .unwrap()
        .unwrap();
    process.handle(&job).await.unwrap();
    let first = std::fs::read(album.staging_dir().join(SIDECAR_FILE_NAME)).unwrap();
    // Same job delivered again: the existing record is left untouched
    process.handle(&job).await.unwrap();
    assert_eq!(
        std::fs::read(album.staging_dir().join(SIDECAR_FILE_NAME)).unwrap(),
        first
    );
    queue.complete(job.id).await.unwrap();

    queue.enqueue(move_request(&album)).await.unwrap();
    let job = queue
        .dequeue(QueueName::Default, &[JobKind::Move])
        .await
        .unwrap()
        .unwrap();
    mover.handle(&job).await.unwrap();
    mover.handle(&job).await.unwrap();
    assert_eq!(std::fs::read_dir(album.target_dir()).unwrap().count(), 4);
}

#[tokio::test]
async fn test_move_is_withheld_while_library_storage_alerts() {
    let catalog = test_catalog().await;
    let queue = queue(&catalog);
    let album = staged_album().await;
    let sampler = FixedSampler::new();
    let monitored = album.work.path().to_path_buf();
    let (probe, gate) = gate(&[monitored.as_path()], sampler.clone());
    let workers = group(
        queue.clone(),
        HandlerRegistry::new().register(Arc::new(MoveHandler::new(gate))),
    );

    sampler.set(&monitored, 96.0);
    probe.probe_all().await;

    let handle = queue.enqueue(move_request(&album)).await.unwrap();
    let outcome = workers.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.state, JobState::Scheduled);
    let job = queue.get(handle.job_id).await.unwrap().unwrap();
    assert!(job.last_error.unwrap().starts_with("placement withheld"));
    assert!(!album.target_dir().exists());

    // Usage drops: the retry goes through
    sampler.set(&monitored, 50.0);
    probe.probe_all().await;
    let outcome = workers.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.state, JobState::Completed);
    assert!(album.target_dir().join("01.flac").is_file());
}

#[tokio::test]
async fn test_process_of_unknown_group_is_permanent() {
    let album = staged_album().await;
    let mut request = process_request(&album);
    request.payload["group_id"] = json!("nobody::nothing_unknown");

    let catalog = test_catalog().await;
    let queue = queue(&catalog);
    queue.enqueue(request).await.unwrap();
    let job = queue
        .dequeue(QueueName::Default, &[JobKind::Process])
        .await
        .unwrap()
        .unwrap();

    let failure = ProcessHandler.handle(&job).await.unwrap_err();
    assert!(!failure.retryable, "{}", failure);
}

#[tokio::test]
async fn test_multi_disc_album_keeps_every_track() {
    let catalog = test_catalog().await;
    let queue = queue(&catalog);
    let album = stage(|inbound| {
        for (disc, title) in [("CD1", "Side A"), ("CD2", "Side C")] {
            let mut tags = Track::new("Led Zeppelin", "Physical Graffiti", 1, Some(1975));
            tags.title = title.to_string();
            write_track(inbound, &format!("{}/01.flac", disc), &tags);
        }
    })
    .await;
    assert_eq!(album.group.track_count, 2);

    let (_probe, gate) = gate(&[], FixedSampler::new());
    let workers = group(
        queue.clone(),
        HandlerRegistry::new()
            .register(Arc::new(ProcessHandler))
            .register(Arc::new(MoveHandler::new(gate))),
    );

    queue.enqueue(process_request(&album)).await.unwrap();
    assert_eq!(workers.run_once().await.unwrap().unwrap().state, JobState::Completed);
    let sidecar = read_sidecar(&album.staging_dir()).await.unwrap().unwrap();
    assert!(sidecar.validation.is_valid, "{:?}", sidecar.validation.errors);

    queue.enqueue(move_request(&album)).await.unwrap();
    assert_eq!(workers.run_once().await.unwrap().unwrap().state, JobState::Completed);

    let target = album.target_dir();
    let first = std::fs::read_to_string(target.join("CD1").join("01.flac")).unwrap();
    let second = std::fs::read_to_string(target.join("CD2").join("01.flac")).unwrap();
    assert!(first.contains("Side A"));
    assert!(second.contains("Side C"));
    assert!(!target.join("01.flac").exists());
    assert!(target.join(SIDECAR_FILE_NAME).is_file());
}
