//! Ingest pipeline
//!
//! Ties the components together for one scan run:
//!
//! 1. create a staging store for the run
//! 2. scan the root into it
//! 3. group staged files into albums
//! 4. per album: ensure the catalog artist, assign its directory code,
//!    resolve the staging path and enqueue a `process` job
//!
//! Placement into a library is a separate step ([`IngestPipeline::place_album`])
//! gated on capacity.

use crate::config::{IngestConfig, LibraryConfig};
use crate::db::artists::{ensure_artist, Artist};
use crate::db::staging::{scan_id_for, StagingStore};
use crate::jobs::handlers::{MovePayload, ProcessPayload};
use crate::jobs::{Admission, EnqueueRequest, JobError, JobHandle, JobKind, JobQueue, PlacementGate};
use crate::models::{AlbumGroup, ScannedFile};
use crate::services::album_grouping::{AlbumGroupingEngine, GroupingSummary, UNKNOWN_ARTIST};
use crate::services::directory_codes::{CodeError, DirectoryCodeGenerator, DirectoryCodeSession};
use crate::services::file_scanner::{FileScanner, ScanError, ScanStatistics};
use crate::services::fingerprinter::{ContentFingerprinter, LoftyTagReader, TagReader};
use crate::services::path_templates::{PathError, PathTemplateResolver, PathValues, ResolutionMode};
use crate::services::sidecar::{AlbumType, SidecarArtist};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tagshelf_common::events::EventBus;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Database(#[from] tagshelf_common::Error),

    #[error(transparent)]
    Code(#[from] CodeError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Job(#[from] JobError),
}

/// One album carried into staging
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAlbum {
    pub group_id: String,
    pub group_hash: String,
    pub artist: String,
    pub album: String,
    pub year: Option<i32>,
    pub track_count: usize,
    pub directory_code: String,
    /// Absolute staging directory for the album
    pub staging_dir: PathBuf,
    pub job: JobHandle,
}

/// Album group that could not be planned
#[derive(Debug, Clone, Serialize)]
pub struct GroupRejection {
    pub group_id: String,
    pub reason: String,
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub scan_id: String,
    pub staging_db: PathBuf,
    pub statistics: ScanStatistics,
    pub grouping: GroupingSummary,
    pub albums: Vec<PlannedAlbum>,
    pub rejections: Vec<GroupRejection>,
}

/// Outcome of a placement request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Placement {
    Enqueued { job: JobHandle, target_dir: PathBuf },
    Withheld { reason: String },
}

/// Album values resolved against the catalog
struct AlbumContext {
    artist: Artist,
    directory_code: String,
    values: PathValues,
}

/// Scan → group → plan, plus capacity-gated placement
pub struct IngestPipeline {
    config: IngestConfig,
    catalog: SqlitePool,
    queue: Arc<dyn JobQueue>,
    gate: PlacementGate,
    codes: DirectoryCodeSession,
    resolver: PathTemplateResolver,
    staging_folder: PathBuf,
    tag_reader: Arc<dyn TagReader>,
    event_bus: Option<EventBus>,
}

impl IngestPipeline {
    pub fn new(
        config: IngestConfig,
        catalog: SqlitePool,
        queue: Arc<dyn JobQueue>,
        gate: PlacementGate,
        staging_folder: PathBuf,
    ) -> Result<Self, PipelineError> {
        let generator = DirectoryCodeGenerator::new(config.directory_codes.clone())?;
        let codes = DirectoryCodeSession::new(catalog.clone(), generator);
        let resolver = PathTemplateResolver::new(config.paths.clone());

        Ok(Self {
            config,
            catalog,
            queue,
            gate,
            codes,
            resolver,
            staging_folder,
            tag_reader: Arc::new(LoftyTagReader),
            event_bus: None,
        })
    }

    /// Replace the tag reader used by the scanner
    pub fn with_tag_reader(mut self, tag_reader: Arc<dyn TagReader>) -> Self {
        self.tag_reader = tag_reader;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn staging_folder(&self) -> &Path {
        &self.staging_folder
    }

    /// Run scan, grouping and planning for `root`
    pub async fn run(
        &self,
        root: &Path,
        library: Option<&LibraryConfig>,
        cancel: CancellationToken,
    ) -> Result<IngestReport, PipelineError> {
        let scan_id = scan_id_for(Utc::now());
        let store = StagingStore::create(&self.staging_folder, &scan_id).await?;
        let result = self.run_with_store(root, library, &store, cancel).await;
        store.close().await;
        result
    }

    async fn run_with_store(
        &self,
        root: &Path,
        library: Option<&LibraryConfig>,
        store: &StagingStore,
        cancel: CancellationToken,
    ) -> Result<IngestReport, PipelineError> {
        let mut scanner = FileScanner::new(
            self.config.scanner.clone(),
            ContentFingerprinter::new(Arc::clone(&self.tag_reader)),
        );
        if let Some(bus) = &self.event_bus {
            scanner = scanner.with_event_bus(bus.clone());
        }

        let statistics = scanner.scan(root, store, cancel).await?;
        let mut report = IngestReport {
            scan_id: store.scan_id().to_string(),
            staging_db: store.path().to_path_buf(),
            statistics,
            grouping: GroupingSummary::default(),
            albums: Vec::new(),
            rejections: Vec::new(),
        };

        if report.statistics.cancelled {
            warn!(scan_id = %report.scan_id, "Scan cancelled, skipping album planning");
            return Ok(report);
        }

        report.grouping = AlbumGroupingEngine::new(self.config.grouping.year_tie_break)
            .run(store)
            .await?;

        for group in store.album_groups().await? {
            match self.plan_album(store, &group, library).await {
                Ok(planned) => report.albums.push(planned),
                Err(e) => {
                    warn!(group_id = %group.group_id, error = %e, "Album group rejected");
                    report.rejections.push(GroupRejection {
                        group_id: group.group_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            scan_id = %report.scan_id,
            files = report.statistics.files_discovered,
            albums = report.albums.len(),
            rejected = report.rejections.len(),
            "Ingest run complete"
        );
        Ok(report)
    }

    async fn album_context(
        &self,
        group: &AlbumGroup,
        files: &[ScannedFile],
        library: Option<&LibraryConfig>,
    ) -> Result<AlbumContext, PipelineError> {
        let artist_name = match group.artist.trim() {
            "" => UNKNOWN_ARTIST,
            name => name,
        };
        let artist = ensure_artist(&self.catalog, artist_name).await?;
        let code = self.codes.code_for_artist(artist.guid, &artist.name).await?;

        let values = PathValues {
            library: library.map(|l| l.name.clone()),
            artist_dir_code: Some(code.code.clone()),
            artist: Some(artist.name.clone()),
            album: Some(group.album.clone()).filter(|a| !a.trim().is_empty()),
            year: group.year,
            genre: dominant_genre(files),
            album_type: Some(AlbumType::from_track_count(files.len()).as_str().to_string()),
        };

        Ok(AlbumContext {
            artist,
            directory_code: code.code,
            values,
        })
    }

    fn staging_dir(
        &self,
        scan_id: &str,
        values: &PathValues,
        library: Option<&LibraryConfig>,
    ) -> Result<PathBuf, PathError> {
        let resolved = self.resolver.resolve(
            ResolutionMode::Staging,
            values,
            library.map(|l| &l.templates),
        )?;
        Ok(self.staging_folder.join(scan_id).join(resolved.path))
    }

    async fn plan_album(
        &self,
        store: &StagingStore,
        group: &AlbumGroup,
        library: Option<&LibraryConfig>,
    ) -> Result<PlannedAlbum, PipelineError> {
        let files = store.files_in_group(&group.group_id).await?;
        let context = self.album_context(group, &files, library).await?;
        let staging_dir = self.staging_dir(store.scan_id(), &context.values, library)?;

        let payload = ProcessPayload {
            scan_id: store.scan_id().to_string(),
            staging_db: store.path().to_path_buf(),
            group_id: group.group_id.clone(),
            staging_dir: staging_dir.clone(),
            artist: SidecarArtist {
                name: context.artist.name.clone(),
                name_normalized: context.artist.name_normalized.clone(),
                directory_code: context.directory_code.clone(),
            },
        };
        let request = EnqueueRequest::new(JobKind::Process, &group.group_hash, &payload)
            .map_err(JobError::from)?;
        let job = self.queue.enqueue(request).await?;

        Ok(PlannedAlbum {
            group_id: group.group_id.clone(),
            group_hash: group.group_hash.clone(),
            artist: context.artist.name,
            album: group.album.clone(),
            year: group.year,
            track_count: group.track_count,
            directory_code: context.directory_code,
            staging_dir,
            job,
        })
    }

    /// Enqueue placement of a staged album into `library`, unless the
    /// library's storage is alerting
    pub async fn place_album(
        &self,
        staging_db: &Path,
        group_id: &str,
        library: &LibraryConfig,
    ) -> Result<Placement, PipelineError> {
        let store = StagingStore::open(staging_db).await?;
        let loaded = async {
            let group = store.album_group(group_id).await?;
            let files = store.files_in_group(group_id).await?;
            Ok::<_, tagshelf_common::Error>((group, files))
        }
        .await;
        let scan_id = store.scan_id().to_string();
        store.close().await;
        let (group, files) = loaded?;

        let context = self.album_context(&group, &files, Some(library)).await?;
        let production = self.resolver.resolve(
            ResolutionMode::Production,
            &context.values,
            Some(&library.templates),
        )?;
        let target_dir = library.root.join(&production.path);

        if let Admission::Withheld { reason } = self.gate.admit(&library.root).await {
            return Ok(Placement::Withheld { reason });
        }

        let payload = MovePayload {
            staging_db: staging_db.to_path_buf(),
            group_id: group.group_id.clone(),
            library: library.name.clone(),
            library_root: library.root.clone(),
            staging_dir: self.staging_dir(&scan_id, &context.values, Some(library))?,
            target_dir: target_dir.clone(),
        };
        let request = EnqueueRequest::new(JobKind::Move, &group.group_hash, &payload)
            .map_err(JobError::from)?;
        let job = self.queue.enqueue(request).await?;

        info!(
            group_id = %group.group_id,
            library = %library.name,
            target = %target_dir.display(),
            merged = !job.accepted,
            "Placement enqueued"
        );
        Ok(Placement::Enqueued { job, target_dir })
    }
}

/// Most common non-empty genre among the files; ties go to the
/// alphabetically first
fn dominant_genre(files: &[ScannedFile]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for genre in files
        .iter()
        .filter_map(|f| f.tags.genre.as_deref().map(str::trim))
        .filter(|g| !g.is_empty())
    {
        *counts.entry(genre).or_default() += 1;
    }

    counts
        .into_iter()
        .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then_with(|| b.cmp(a)))
        .map(|(genre, _)| genre.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TagFields;

    fn file_with_genre(genre: Option<&str>) -> ScannedFile {
        ScannedFile {
            id: None,
            path: PathBuf::from("/in/a.flac"),
            size: 1,
            content_hash: None,
            modified_at: None,
            tags: TagFields {
                genre: genre.map(String::from),
                ..Default::default()
            },
            is_valid: true,
            invalid_reason: None,
            group_hash: None,
            group_id: None,
        }
    }

    #[test]
    fn test_dominant_genre() {
        let files = vec![
            file_with_genre(Some("Rock")),
            file_with_genre(Some("Blues")),
            file_with_genre(Some("Rock")),
            file_with_genre(None),
        ];
        assert_eq!(dominant_genre(&files).as_deref(), Some("Rock"));
        assert_eq!(dominant_genre(&files[1..2]).as_deref(), Some("Blues"));
        assert_eq!(dominant_genre(&[file_with_genre(Some(" "))]), None);
    }

    #[test]
    fn test_genre_tie_prefers_alphabetical() {
        let files = vec![file_with_genre(Some("Rock")), file_with_genre(Some("Blues"))];
        assert_eq!(dominant_genre(&files).as_deref(), Some("Blues"));
    }
}
