//! Shared fixtures for tagshelf-ingest integration tests
//!
//! Test "audio" files are small text files: the tag reader below parses
//! `artist|album|title|track|year|album_artist|genre` from their content, and
//! a file starting with `CORRUPT` fails tag parsing.

#![allow(dead_code)]

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tagshelf_common::db::init::init_catalog;
use tagshelf_ingest::config::ScannerConfig;
use tagshelf_ingest::models::TagFields;
use tagshelf_ingest::services::capacity_probe::{ProbeError, UsageSampler};
use tagshelf_ingest::services::fingerprinter::{MetadataError, TagReader};
use tempfile::TempDir;

/// Catalog database in a temporary directory
///
/// `dir` must be kept alive for the duration of the test
pub struct TestCatalog {
    pub dir: TempDir,
    pub pool: SqlitePool,
}

impl TestCatalog {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

pub async fn test_catalog() -> TestCatalog {
    let dir = TempDir::new().unwrap();
    let pool = init_catalog(&dir.path().join("catalog.db")).await.unwrap();
    TestCatalog { dir, pool }
}

/// Tag values for one fixture file
#[derive(Debug, Clone, Default)]
pub struct Track {
    pub artist: &'static str,
    pub album: &'static str,
    pub title: String,
    pub track: Option<u32>,
    pub year: Option<i32>,
    pub album_artist: Option<&'static str>,
    pub genre: Option<&'static str>,
}

impl Track {
    pub fn new(artist: &'static str, album: &'static str, track: u32, year: Option<i32>) -> Self {
        Self {
            artist,
            album,
            title: format!("Track {}", track),
            track: Some(track),
            year,
            ..Default::default()
        }
    }

    fn encode(&self) -> String {
        [
            self.artist.to_string(),
            self.album.to_string(),
            self.title.clone(),
            self.track.map(|t| t.to_string()).unwrap_or_default(),
            self.year.map(|y| y.to_string()).unwrap_or_default(),
            self.album_artist.unwrap_or_default().to_string(),
            self.genre.unwrap_or_default().to_string(),
        ]
        .join("|")
    }
}

/// Write a fixture track, creating parent directories
pub fn write_track(dir: &Path, name: &str, track: &Track) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, track.encode()).unwrap();
    path
}

/// Write a fixture file whose tags cannot be parsed
pub fn write_corrupt(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, format!("CORRUPT {}", name)).unwrap();
    path
}

/// Parses fixture file content into tags
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentTagReader;

fn field(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl TagReader for ContentTagReader {
    fn read_tags(&self, path: &Path) -> Result<TagFields, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        if content.starts_with("CORRUPT") {
            return Err(MetadataError::ReadError("invalid frame header".to_string()));
        }

        let parts: Vec<&str> = content.split('|').collect();
        let get = |i: usize| parts.get(i).copied().unwrap_or_default();
        Ok(TagFields {
            artist: field(get(0)),
            album: field(get(1)),
            title: field(get(2)),
            track_number: get(3).parse().ok(),
            year: get(4).parse().ok(),
            album_artist: field(get(5)),
            genre: field(get(6)),
            duration_secs: Some(180.0),
            bitrate_kbps: Some(320),
            sample_rate: Some(44100),
            ..Default::default()
        })
    }
}

pub fn tag_reader() -> Arc<dyn TagReader> {
    Arc::new(ContentTagReader)
}

/// Small scanner configuration that still exercises batching
pub fn scanner_config() -> ScannerConfig {
    ScannerConfig {
        workers: 4,
        work_queue_capacity: 16,
        result_queue_capacity: 16,
        batch_size: 25,
        ..Default::default()
    }
}

/// Usage sampler answering from a settable table
#[derive(Debug, Default)]
pub struct FixedSampler {
    usage: Mutex<HashMap<PathBuf, Result<f64, String>>>,
}

impl FixedSampler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, path: &Path, used_percent: f64) {
        self.usage
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), Ok(used_percent));
    }

    pub fn fail(&self, path: &Path, reason: &str) {
        self.usage
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), Err(reason.to_string()));
    }
}

impl UsageSampler for FixedSampler {
    fn used_percent(&self, path: &Path) -> Result<f64, ProbeError> {
        match self.usage.lock().unwrap().get(path) {
            Some(Ok(used)) => Ok(*used),
            Some(Err(reason)) => Err(ProbeError::Unavailable {
                path: path.to_path_buf(),
                reason: reason.clone(),
            }),
            None => Err(ProbeError::NoDisk(path.to_path_buf())),
        }
    }
}
