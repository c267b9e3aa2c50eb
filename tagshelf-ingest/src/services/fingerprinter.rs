//! Content fingerprinting
//!
//! Hashes one file's bytes (SHA-256, 1MB chunks) and reads its tags through a
//! [`TagReader`]. Per-file problems never surface as errors: they produce a
//! record with `is_valid = false` and a reason.

use crate::models::{ScannedFile, TagFields};
use chrono::{DateTime, Utc};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::ItemKey;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Recognized media file extensions (compared case-insensitively)
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "m4a", "aac", "mp4", "wav", "aiff", "aif", "wv", "wma",
];

const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Check whether a path carries a recognized media extension
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

/// Tag reading errors
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The container or its tags could not be parsed
    #[error("Failed to read tags: {0}")]
    ReadError(String),

    /// I/O error (file read)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Reads tag fields and audio properties from one file
pub trait TagReader: Send + Sync {
    fn read_tags(&self, path: &Path) -> Result<TagFields, MetadataError>;
}

/// lofty-backed [`TagReader`]
#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyTagReader;

impl TagReader for LoftyTagReader {
    fn read_tags(&self, path: &Path) -> Result<TagFields, MetadataError> {
        let tagged_file = Probe::open(path)
            .map_err(|e| MetadataError::ReadError(e.to_string()))?
            .read()
            .map_err(|e| MetadataError::ReadError(e.to_string()))?;

        let properties = tagged_file.properties();
        let duration = properties.duration();
        let mut fields = TagFields {
            duration_secs: (!duration.is_zero()).then(|| duration.as_secs_f64()),
            bitrate_kbps: properties.audio_bitrate(),
            sample_rate: properties.sample_rate(),
            ..Default::default()
        };

        if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            fields.artist = tag.artist().map(|s| s.to_string());
            fields.album_artist = tag.get_string(&ItemKey::AlbumArtist).map(str::to_string);
            fields.album = tag.album().map(|s| s.to_string());
            fields.title = tag.title().map(|s| s.to_string());
            fields.track_number = tag.track();
            fields.disc_number = tag.disk();
            fields.year = tag.year().and_then(|y| i32::try_from(y).ok()).filter(|y| *y > 0);
            fields.genre = tag.genre().map(|s| s.to_string());
        }

        Ok(fields)
    }
}

/// SHA-256 hex digest of a file's content, streamed in 1MB chunks
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Produces one [`ScannedFile`] per media file
///
/// Blocking: callers on the async runtime run it inside `spawn_blocking`.
#[derive(Clone)]
pub struct ContentFingerprinter {
    tag_reader: Arc<dyn TagReader>,
}

impl ContentFingerprinter {
    pub fn new(tag_reader: Arc<dyn TagReader>) -> Self {
        Self { tag_reader }
    }

    /// Fingerprint one file; never fails, invalid records carry a reason
    pub fn fingerprint(&self, path: &Path) -> ScannedFile {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable file");
                return ScannedFile::invalid(path.to_path_buf(), format!("unreadable: {}", e));
            }
        };

        let mut record = ScannedFile::invalid(path.to_path_buf(), "");
        record.size = metadata.len();
        record.modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);

        match hash_file(path) {
            Ok(hash) => record.content_hash = Some(hash),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Hash failed");
                record.mark_invalid(format!("hash failed: {}", e));
                return record;
            }
        }

        match self.tag_reader.read_tags(path) {
            Ok(tags) => record.tags = tags,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Tag parse failed");
                record.mark_invalid(format!("tag parse failed: {}", e));
                return record;
            }
        }

        let missing = record.tags.missing_required();
        if missing.is_empty() {
            record.is_valid = true;
            record.invalid_reason = None;
        } else {
            tracing::debug!(path = %path.display(), missing = ?missing, "Missing required tags");
            record.mark_invalid(format!("missing required tags: {}", missing.join(", ")));
        }

        record
    }
}

impl Default for ContentFingerprinter {
    fn default() -> Self {
        Self::new(Arc::new(LoftyTagReader))
    }
}
