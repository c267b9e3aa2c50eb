//! Built-in job handlers
//!
//! - `process`: writes the album's sidecar record into its staging directory
//! - `move`: places the album's files and sidecar at the production path
//!
//! Both are safe to re-run: a readable sidecar is left alone and files
//! already present at the destination with the expected size are skipped.
//! Files keep their path relative to the album's common directory, so disc
//! sub-directories survive placement.

use super::admission::{Admission, PlacementGate};
use super::types::{Job, JobKind};
use super::worker::{JobFailure, JobHandler};
use crate::db::staging::StagingStore;
use crate::models::{album_relative_paths, ScannedFile};
use crate::services::sidecar::{
    build_sidecar, read_sidecar, write_sidecar, SidecarArtist, SidecarWrite, SIDECAR_FILE_NAME,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tagshelf_common::Error;
use tracing::{debug, info};

/// Payload of a `process` job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPayload {
    pub scan_id: String,
    pub staging_db: PathBuf,
    pub group_id: String,
    /// Album directory under the run's staging area
    pub staging_dir: PathBuf,
    pub artist: SidecarArtist,
}

/// Payload of a `move` job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePayload {
    pub staging_db: PathBuf,
    pub group_id: String,
    pub library: String,
    pub library_root: PathBuf,
    /// Staging album directory holding the sidecar
    pub staging_dir: PathBuf,
    /// Absolute production album directory
    pub target_dir: PathBuf,
}

fn decode<T: serde::de::DeserializeOwned>(job: &Job) -> Result<T, JobFailure> {
    job.payload_as()
        .map_err(|e| JobFailure::permanent(format!("invalid {} payload: {}", job.kind, e)))
}

fn store_failure(err: Error) -> JobFailure {
    match err {
        Error::NotFound(what) => JobFailure::permanent(format!("not found: {}", what)),
        other => JobFailure::retryable(other.to_string()),
    }
}

fn io_failure(context: &str, err: io::Error) -> JobFailure {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            JobFailure::permanent(format!("{}: {}", context, err))
        }
        _ => JobFailure::retryable(format!("{}: {}", context, err)),
    }
}

/// Writes the album sidecar record
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessHandler;

#[async_trait]
impl JobHandler for ProcessHandler {
    fn kind(&self) -> JobKind {
        JobKind::Process
    }

    async fn handle(&self, job: &Job) -> Result<(), JobFailure> {
        let payload: ProcessPayload = decode(job)?;

        let store = StagingStore::open(&payload.staging_db).await.map_err(store_failure)?;
        let loaded = async {
            let group = store.album_group(&payload.group_id).await?;
            let files = store.files_in_group(&payload.group_id).await?;
            Ok::<_, Error>((group, files))
        }
        .await;
        store.close().await;
        let (group, files) = loaded.map_err(store_failure)?;

        let record = build_sidecar(&payload.scan_id, &group, &files, payload.artist);
        match write_sidecar(&payload.staging_dir, &record)
            .await
            .map_err(|e| io_failure("sidecar write", e))?
        {
            SidecarWrite::Written(path) => {
                info!(
                    job_id = %job.id,
                    group_id = %payload.group_id,
                    tracks = record.tracks.len(),
                    valid = record.validation.is_valid,
                    path = %path.display(),
                    "Sidecar written"
                );
            }
            SidecarWrite::AlreadyExists(path) => {
                debug!(job_id = %job.id, path = %path.display(), "Sidecar already present");
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FilePlacement {
    Copied,
    AlreadyPresent,
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Copy `source` to `dest` through a `.partial` file, skipping an existing
/// destination of the expected size
async fn place_file(source: &Path, dest: &Path, expected_size: u64) -> Result<FilePlacement, JobFailure> {
    match tokio::fs::metadata(dest).await {
        Ok(meta) if meta.len() == expected_size => return Ok(FilePlacement::AlreadyPresent),
        Ok(meta) => {
            return Err(JobFailure::permanent(format!(
                "{} already exists with a different size ({} bytes, expected {})",
                dest.display(),
                meta.len(),
                expected_size
            )));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_failure("destination check", e)),
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_failure("create destination directory", e))?;
    }

    let partial = partial_path(dest);
    tokio::fs::copy(source, &partial)
        .await
        .map_err(|e| io_failure(&format!("copy {}", source.display()), e))?;
    tokio::fs::rename(&partial, dest)
        .await
        .map_err(|e| io_failure(&format!("rename into {}", dest.display()), e))?;
    Ok(FilePlacement::Copied)
}

/// Album-relative destinations, refusing a group that maps two files to one
/// path or a file onto the sidecar
fn destination_paths(group_id: &str, files: &[ScannedFile]) -> Result<Vec<PathBuf>, JobFailure> {
    let relative = album_relative_paths(files);
    let mut seen = HashSet::new();
    for path in &relative {
        if !seen.insert(path) || path.as_os_str() == SIDECAR_FILE_NAME {
            return Err(JobFailure::permanent(format!(
                "album group {} maps more than one file to {}",
                group_id,
                path.display()
            )));
        }
    }
    Ok(relative)
}

/// Places album files at their production path, re-checking capacity first
#[derive(Clone)]
pub struct MoveHandler {
    gate: PlacementGate,
}

impl MoveHandler {
    pub fn new(gate: PlacementGate) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl JobHandler for MoveHandler {
    fn kind(&self) -> JobKind {
        JobKind::Move
    }

    async fn handle(&self, job: &Job) -> Result<(), JobFailure> {
        let payload: MovePayload = decode(job)?;

        if let Admission::Withheld { reason } = self.gate.admit(&payload.library_root).await {
            return Err(JobFailure::retryable(format!("placement withheld: {}", reason)));
        }

        let store = StagingStore::open(&payload.staging_db).await.map_err(store_failure)?;
        let files = store.files_in_group(&payload.group_id).await;
        store.close().await;
        let files = files.map_err(store_failure)?;
        if files.is_empty() {
            return Err(JobFailure::permanent(format!(
                "album group {} has no files",
                payload.group_id
            )));
        }

        let relative = destination_paths(&payload.group_id, &files)?;

        tokio::fs::create_dir_all(&payload.target_dir)
            .await
            .map_err(|e| io_failure("create target directory", e))?;

        let mut copied = 0usize;
        let mut skipped = 0usize;
        for (file, relative) in files.iter().zip(&relative) {
            let dest = payload.target_dir.join(relative);
            match place_file(&file.path, &dest, file.size).await? {
                FilePlacement::Copied => copied += 1,
                FilePlacement::AlreadyPresent => skipped += 1,
            }
        }

        let sidecar_source = payload.staging_dir.join(SIDECAR_FILE_NAME);
        let sidecar_dest = payload.target_dir.join(SIDECAR_FILE_NAME);
        let sidecar_readable = read_sidecar(&payload.staging_dir)
            .await
            .map_err(|e| io_failure("sidecar read", e))?
            .is_some();
        if sidecar_readable && !tokio::fs::try_exists(&sidecar_dest).await.unwrap_or(false) {
            let size = tokio::fs::metadata(&sidecar_source)
                .await
                .map_err(|e| io_failure("sidecar metadata", e))?
                .len();
            place_file(&sidecar_source, &sidecar_dest, size).await?;
        }

        info!(
            job_id = %job.id,
            library = %payload.library,
            group_id = %payload.group_id,
            target = %payload.target_dir.display(),
            copied,
            skipped,
            "Album placed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_place_file_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("01.flac");
        std::fs::write(&source, b"audio").unwrap();
        let dest = dir.path().join("out.flac");

        assert_eq!(place_file(&source, &dest, 5).await.unwrap(), FilePlacement::Copied);
        assert_eq!(std::fs::read(&dest).unwrap(), b"audio");
        assert!(!partial_path(&dest).exists());
        assert_eq!(
            place_file(&source, &dest, 5).await.unwrap(),
            FilePlacement::AlreadyPresent
        );
    }

    #[tokio::test]
    async fn test_size_conflict_is_permanent() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("01.flac");
        std::fs::write(&source, b"audio").unwrap();
        let dest = dir.path().join("out.flac");
        std::fs::write(&dest, b"other audio").unwrap();

        let failure = place_file(&source, &dest, 5).await.unwrap_err();
        assert!(!failure.retryable);
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let dir = tempfile::TempDir::new().unwrap();
        let failure = place_file(&dir.path().join("gone.flac"), &dir.path().join("out.flac"), 5)
            .await
            .unwrap_err();
        assert!(!failure.retryable);
    }

    #[test]
    fn test_destinations_keep_disc_directories() {
        let files = vec![
            ScannedFile::invalid(PathBuf::from("/in/wall/CD1/01.flac"), "x"),
            ScannedFile::invalid(PathBuf::from("/in/wall/CD2/01.flac"), "x"),
        ];
        let paths = destination_paths("pink floyd::the wall", &files).unwrap();
        assert_eq!(paths, vec![PathBuf::from("CD1/01.flac"), PathBuf::from("CD2/01.flac")]);
    }

    #[test]
    fn test_colliding_destinations_are_permanent() {
        let files = vec![
            ScannedFile::invalid(PathBuf::from("/in/wall/01.flac"), "x"),
            ScannedFile::invalid(PathBuf::from("/in/wall/01.flac"), "x"),
        ];
        let failure = destination_paths("pink floyd::the wall", &files).unwrap_err();
        assert!(!failure.retryable);
        assert!(failure.message.contains("01.flac"));

        let onto_sidecar = vec![
            ScannedFile::invalid(PathBuf::from("/in/wall/01.flac"), "x"),
            ScannedFile::invalid(PathBuf::from("/in/wall/tagshelf.json"), "x"),
        ];
        assert!(destination_paths("pink floyd::the wall", &onto_sidecar).is_err());
    }
}
