//! Scanned file record
//!
//! Owned by its scan run. Immutable once scanned apart from the one-time
//! group assignment written by the grouping engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tag fields and audio properties read from one file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagFields {
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    /// Duration in seconds
    pub duration_secs: Option<f64>,
    /// Bitrate (kbps)
    pub bitrate_kbps: Option<u32>,
    /// Sample rate (Hz)
    pub sample_rate: Option<u32>,
}

impl TagFields {
    /// Names of required fields (artist, album, title) that are empty after trimming
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if is_blank(&self.artist) {
            missing.push("artist");
        }
        if is_blank(&self.album) {
            missing.push("album");
        }
        if is_blank(&self.title) {
            missing.push("title");
        }
        missing
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).map_or(true, str::is_empty)
}

/// One observed file in one scan run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedFile {
    /// Staging row id (None until inserted)
    pub id: Option<i64>,
    pub path: PathBuf,
    pub size: u64,
    /// SHA-256 hex digest of the file content
    pub content_hash: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub tags: TagFields,
    pub is_valid: bool,
    pub invalid_reason: Option<String>,
    pub group_hash: Option<String>,
    pub group_id: Option<String>,
}

impl ScannedFile {
    /// Record for a file that could not be read at all
    pub fn invalid(path: PathBuf, reason: impl Into<String>) -> Self {
        Self {
            id: None,
            path,
            size: 0,
            content_hash: None,
            modified_at: None,
            tags: TagFields::default(),
            is_valid: false,
            invalid_reason: Some(reason.into()),
            group_hash: None,
            group_id: None,
        }
    }

    /// Mark the record invalid, keeping whatever was already extracted
    pub fn mark_invalid(&mut self, reason: impl Into<String>) {
        self.is_valid = false;
        self.invalid_reason = Some(reason.into());
    }

    /// File name component, lossy
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Paths of album member files relative to their deepest common directory
///
/// Files sharing one directory keep their bare names; a multi-disc layout
/// such as `CD1/01.flac` and `CD2/01.flac` keeps the disc sub-directory.
pub fn album_relative_paths(files: &[ScannedFile]) -> Vec<PathBuf> {
    let root = files
        .iter()
        .map(|file| file.path.parent().unwrap_or_else(|| Path::new("")))
        .fold(None::<PathBuf>, |root, parent| {
            Some(match root {
                None => parent.to_path_buf(),
                Some(root) => root
                    .components()
                    .zip(parent.components())
                    .take_while(|(a, b)| a == b)
                    .map(|(a, _)| a)
                    .collect(),
            })
        })
        .unwrap_or_default();

    files
        .iter()
        .map(|file| match file.path.strip_prefix(&root) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
            _ => PathBuf::from(file.file_name()),
        })
        .collect()
}
