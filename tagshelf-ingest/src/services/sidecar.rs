//! Album sidecar records
//!
//! One JSON audit record per processed album, written next to the album as
//! `tagshelf.json`. Sidecars are catalog-independent and immutable: a record
//! is written to `tagshelf.json.partial`, synced, then hard-linked into place,
//! so a readable record is never replaced and a torn write never becomes one.

use crate::models::{album_relative_paths, AlbumGroup, ScannedFile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

pub const SIDECAR_FILE_NAME: &str = "tagshelf.json";
pub const SIDECAR_VERSION: u32 = 1;

/// Status recorded when the sidecar is first written
pub const STATUS_STAGED: &str = "staged";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub version: u32,
    pub processed_at: DateTime<Utc>,
    pub scan_id: String,
    pub artist: SidecarArtist,
    pub album: SidecarAlbum,
    pub tracks: Vec<SidecarTrack>,
    pub status: String,
    pub validation: SidecarValidation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarArtist {
    pub name: String,
    pub name_normalized: String,
    pub directory_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlbumType {
    Single,
    Ep,
    Album,
}

impl AlbumType {
    /// Release type by track count: up to 3 single, up to 6 EP
    pub fn from_track_count(tracks: usize) -> Self {
        match tracks {
            0..=3 => AlbumType::Single,
            4..=6 => AlbumType::Ep,
            _ => AlbumType::Album,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlbumType::Single => "single",
            AlbumType::Ep => "ep",
            AlbumType::Album => "album",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarAlbum {
    pub name: String,
    pub year: Option<i32>,
    pub album_type: AlbumType,
    pub genres: Vec<String>,
    pub is_compilation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarTrack {
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub name: Option<String>,
    /// Seconds
    pub duration: Option<f64>,
    /// Path within the album directory
    pub file_path: String,
    pub file_size: u64,
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    /// SHA-256 of the file content
    pub checksum: Option<String>,
    /// Where the file was found at scan time
    pub original_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Outcome of [`write_sidecar`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarWrite {
    Written(PathBuf),
    /// A record already exists and was left untouched
    AlreadyExists(PathBuf),
}

/// Build the record for one album group from its member files
pub fn build_sidecar(
    scan_id: &str,
    group: &AlbumGroup,
    files: &[ScannedFile],
    artist: SidecarArtist,
) -> SidecarRecord {
    let tracks: Vec<SidecarTrack> = files
        .iter()
        .zip(album_relative_paths(files))
        .map(|(file, relative)| SidecarTrack {
            track_number: file.tags.track_number,
            disc_number: file.tags.disc_number,
            name: file.tags.title.clone(),
            duration: file.tags.duration_secs,
            file_path: relative.to_string_lossy().to_string(),
            file_size: file.size,
            bitrate: file.tags.bitrate_kbps,
            sample_rate: file.tags.sample_rate,
            checksum: file.content_hash.clone(),
            original_path: file.path.clone(),
        })
        .collect();

    let genres: Vec<String> = files
        .iter()
        .filter_map(|f| f.tags.genre.as_deref().map(str::trim))
        .filter(|g| !g.is_empty())
        .map(String::from)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let track_artists: HashSet<String> = files
        .iter()
        .filter_map(|f| f.tags.artist.as_deref())
        .map(|a| a.trim().to_lowercase())
        .collect();
    let various = files.iter().any(|f| {
        f.tags
            .album_artist
            .as_deref()
            .is_some_and(|a| a.trim().eq_ignore_ascii_case("various artists"))
    });

    SidecarRecord {
        version: SIDECAR_VERSION,
        processed_at: Utc::now(),
        scan_id: scan_id.to_string(),
        artist,
        album: SidecarAlbum {
            name: group.album.clone(),
            year: group.year,
            album_type: AlbumType::from_track_count(tracks.len()),
            genres,
            is_compilation: various || track_artists.len() > 1,
        },
        validation: validate_tracks(&tracks, group.year),
        tracks,
        status: STATUS_STAGED.to_string(),
    }
}

fn validate_tracks(tracks: &[SidecarTrack], year: Option<i32>) -> SidecarValidation {
    let mut validation = SidecarValidation::default();

    if tracks.is_empty() {
        validation.errors.push("album has no tracks".to_string());
    }
    if year.is_none() {
        validation.warnings.push("no release year".to_string());
    }

    let mut seen = HashSet::new();
    let mut names = HashSet::new();
    for track in tracks {
        match track.track_number {
            None => validation
                .warnings
                .push(format!("{}: missing track number", track.file_path)),
            Some(number) => {
                if !seen.insert((track.disc_number.unwrap_or(1), number)) {
                    validation.warnings.push(format!(
                        "duplicate track number {} on disc {}",
                        number,
                        track.disc_number.unwrap_or(1)
                    ));
                }
            }
        }
        if !names.insert(track.file_path.as_str()) {
            validation
                .errors
                .push(format!("duplicate file path {}", track.file_path));
        }
    }

    validation.is_valid = validation.errors.is_empty();
    validation
}

/// Write `tagshelf.json` into `dir` unless a readable record already exists
///
/// An unreadable record left by an interrupted write is replaced.
pub async fn write_sidecar(dir: &Path, record: &SidecarRecord) -> io::Result<SidecarWrite> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(SIDECAR_FILE_NAME);

    let replace = match read_sidecar(dir).await {
        Ok(Some(_)) => return Ok(SidecarWrite::AlreadyExists(path)),
        Ok(None) => false,
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            warn!(path = %path.display(), error = %e, "Replacing unreadable sidecar");
            true
        }
        Err(e) => return Err(e),
    };

    let json = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
    let partial = dir.join(format!("{}.partial", SIDECAR_FILE_NAME));
    let mut file = tokio::fs::File::create(&partial).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    if replace {
        tokio::fs::rename(&partial, &path).await?;
        return Ok(SidecarWrite::Written(path));
    }

    let linked = tokio::fs::hard_link(&partial, &path).await;
    let _ = tokio::fs::remove_file(&partial).await;
    match linked {
        Ok(()) => Ok(SidecarWrite::Written(path)),
        // Lost a race with a concurrent writer
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(SidecarWrite::AlreadyExists(path)),
        Err(e) => Err(e),
    }
}

/// Read the sidecar in `dir`, if present
pub async fn read_sidecar(dir: &Path) -> io::Result<Option<SidecarRecord>> {
    match tokio::fs::read(dir.join(SIDECAR_FILE_NAME)).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
