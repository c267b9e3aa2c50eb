//! Per-run staging store
//!
//! One SQLite file per scan run (`<staging_folder>/<scan_id>.db`) holding the
//! scanned file rows and the grouping engine's assignments. Independent of
//! the long-lived catalog and discarded with the run.

use crate::models::{AlbumGroup, ScannedFile, TagFields};
use crate::services::album_grouping::{
    effective_artist, year_from_group_id, GroupAssignment, GroupingRecord,
};
use crate::services::file_scanner::ScanStatistics;
use crate::utils::{begin_monitored, retry_on_lock};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tagshelf_common::db::init::{connect_sqlite, DEFAULT_MAX_LOCK_WAIT_MS};
use tagshelf_common::time::{parse_db_timestamp, to_db_timestamp};
use tagshelf_common::{Error, Result};

/// Generate a scan id from a timestamp (`scan_%Y%m%d_%H%M%S_%3f`)
pub fn scan_id_for(timestamp: DateTime<Utc>) -> String {
    timestamp.format("scan_%Y%m%d_%H%M%S_%3f").to_string()
}

/// Write-optimized record set for one scan run
#[derive(Debug, Clone)]
pub struct StagingStore {
    pool: SqlitePool,
    scan_id: String,
    path: PathBuf,
    max_lock_wait_ms: u64,
}

const FILE_COLUMNS: &str = "id, path, size, content_hash, modified_at, artist, album_artist, album, \
     title, track_number, disc_number, year, genre, duration_secs, bitrate_kbps, sample_rate, \
     is_valid, invalid_reason, group_hash, group_id";

impl StagingStore {
    /// Create the store for a new scan run
    pub async fn create(staging_folder: &Path, scan_id: &str) -> Result<Self> {
        let path = staging_folder.join(format!("{}.db", scan_id));
        if path.exists() {
            return Err(Error::InvalidInput(format!(
                "Staging store already exists: {}",
                path.display()
            )));
        }

        let store = Self::connect(&path, scan_id).await?;
        sqlx::query("INSERT INTO scan_run (scan_id, started_at) VALUES (?, ?)")
            .bind(scan_id)
            .bind(to_db_timestamp(Utc::now()))
            .execute(&store.pool)
            .await?;

        tracing::info!(scan_id, path = %path.display(), "Staging store created");
        Ok(store)
    }

    /// Open an existing staging store file
    pub async fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!("Staging store {}", path.display())));
        }

        let mut store = Self::connect(path, "").await?;
        let scan_id: Option<String> = sqlx::query_scalar("SELECT scan_id FROM scan_run LIMIT 1")
            .fetch_optional(&store.pool)
            .await?;
        store.scan_id = scan_id.ok_or_else(|| {
            Error::Internal(format!("Staging store {} has no scan run", path.display()))
        })?;
        Ok(store)
    }

    async fn connect(path: &Path, scan_id: &str) -> Result<Self> {
        let pool = connect_sqlite(path, 4).await?;
        create_staging_schema(&pool).await?;
        Ok(Self {
            pool,
            scan_id: scan_id.to_string(),
            path: path.to_path_buf(),
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        })
    }

    /// Override how long lock-contended writes are retried
    pub fn with_max_lock_wait_ms(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert one batch of records in a single transaction
    pub async fn insert_batch(&self, files: &[ScannedFile]) -> Result<usize> {
        if files.is_empty() {
            return Ok(0);
        }

        retry_on_lock("staging batch insert", self.max_lock_wait_ms, move || async move {
            let mut tx = begin_monitored(&self.pool, "staging::insert_batch").await?;
            for file in files {
                insert_file(&mut **tx.inner_mut()?, file).await?;
            }
            tx.commit().await?;
            Ok(files.len())
        })
        .await
    }

    /// Record the run's final statistics
    pub async fn record_completion(&self, root: &Path, stats: &ScanStatistics) -> Result<()> {
        sqlx::query(
            "UPDATE scan_run SET root = ?, completed_at = ?, cancelled = ?, statistics = ? WHERE scan_id = ?",
        )
        .bind(root.to_string_lossy().to_string())
        .bind(to_db_timestamp(Utc::now()))
        .bind(stats.cancelled)
        .bind(serde_json::to_string(stats)?)
        .bind(&self.scan_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// (valid, invalid) row counts
    pub async fn counts(&self) -> Result<(usize, usize)> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(is_valid), 0) AS valid, COALESCE(SUM(1 - is_valid), 0) AS invalid FROM scanned_files",
        )
        .fetch_one(&self.pool)
        .await?;
        let valid: i64 = row.get("valid");
        let invalid: i64 = row.get("invalid");
        Ok((valid as usize, invalid as usize))
    }

    /// Grouping input for every valid record, ordered by id
    pub async fn grouping_records(&self) -> Result<Vec<GroupingRecord>> {
        let rows = sqlx::query(
            "SELECT id, artist, album_artist, album, year FROM scanned_files WHERE is_valid = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| GroupingRecord {
                id: row.get("id"),
                artist: row.get("artist"),
                album_artist: row.get("album_artist"),
                album: row.get("album"),
                year: row.get("year"),
            })
            .collect())
    }

    /// Write group assignments back in one transaction
    pub async fn assign_groups(&self, assignments: &[GroupAssignment]) -> Result<()> {
        retry_on_lock("staging group assignment", self.max_lock_wait_ms, move || async move {
            let mut tx = begin_monitored(&self.pool, "staging::assign_groups").await?;
            for assignment in assignments {
                sqlx::query("UPDATE scanned_files SET group_id = ?, group_hash = ? WHERE id = ?")
                    .bind(&assignment.group_id)
                    .bind(&assignment.group_hash)
                    .bind(assignment.id)
                    .execute(&mut **tx.inner_mut()?)
                    .await?;
            }
            tx.commit().await
        })
        .await
    }

    /// All files, ordered by id
    pub async fn files(&self) -> Result<Vec<ScannedFile>> {
        let rows = sqlx::query(&format!("SELECT {} FROM scanned_files ORDER BY id", FILE_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Invalid files with their reasons, for operator review
    pub async fn invalid_files(&self) -> Result<Vec<ScannedFile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scanned_files WHERE is_valid = 0 ORDER BY id",
            FILE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Members of one group, ordered by disc, track, then path
    pub async fn files_in_group(&self, group_id: &str) -> Result<Vec<ScannedFile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scanned_files WHERE group_id = ? \
             ORDER BY COALESCE(disc_number, 0), COALESCE(track_number, 0), path",
            FILE_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Album group view computed from the grouped rows, ordered by group id
    pub async fn album_groups(&self) -> Result<Vec<AlbumGroup>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scanned_files WHERE group_id IS NOT NULL ORDER BY id",
            FILE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut by_group: BTreeMap<String, Vec<ScannedFile>> = BTreeMap::new();
        for row in &rows {
            let file = file_from_row(row)?;
            if let Some(group_id) = file.group_id.clone() {
                by_group.entry(group_id).or_default().push(file);
            }
        }

        Ok(by_group
            .into_iter()
            .map(|(group_id, members)| summarize_group(group_id, &members))
            .collect())
    }

    /// One album group view by id
    pub async fn album_group(&self, group_id: &str) -> Result<AlbumGroup> {
        let members = self.files_in_group(group_id).await?;
        if members.is_empty() {
            return Err(Error::NotFound(format!("Album group {}", group_id)));
        }
        Ok(summarize_group(group_id.to_string(), &members))
    }

    /// Close the pool (the file stays on disk)
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn create_staging_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_run (
            scan_id TEXT PRIMARY KEY,
            root TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            cancelled INTEGER NOT NULL DEFAULT 0,
            statistics TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scanned_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL,
            size INTEGER NOT NULL,
            content_hash TEXT,
            modified_at TEXT,
            artist TEXT,
            album_artist TEXT,
            album TEXT,
            title TEXT,
            track_number INTEGER,
            disc_number INTEGER,
            year INTEGER,
            genre TEXT,
            duration_secs REAL,
            bitrate_kbps INTEGER,
            sample_rate INTEGER,
            is_valid INTEGER NOT NULL,
            invalid_reason TEXT,
            group_hash TEXT,
            group_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_scanned_files_group ON scanned_files (group_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn insert_file(conn: &mut sqlx::SqliteConnection, file: &ScannedFile) -> Result<()> {
    let tags = &file.tags;
    sqlx::query(
        r#"
        INSERT INTO scanned_files (
            path, size, content_hash, modified_at, artist, album_artist, album, title,
            track_number, disc_number, year, genre, duration_secs, bitrate_kbps, sample_rate,
            is_valid, invalid_reason
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(file.path.to_string_lossy().to_string())
    .bind(file.size as i64)
    .bind(&file.content_hash)
    .bind(file.modified_at.map(to_db_timestamp))
    .bind(&tags.artist)
    .bind(&tags.album_artist)
    .bind(&tags.album)
    .bind(&tags.title)
    .bind(tags.track_number.map(i64::from))
    .bind(tags.disc_number.map(i64::from))
    .bind(tags.year)
    .bind(&tags.genre)
    .bind(tags.duration_secs)
    .bind(tags.bitrate_kbps.map(i64::from))
    .bind(tags.sample_rate.map(i64::from))
    .bind(file.is_valid)
    .bind(&file.invalid_reason)
    .execute(conn)
    .await?;

    Ok(())
}

fn file_from_row(row: &SqliteRow) -> Result<ScannedFile> {
    let path: String = row.get("path");
    let size: i64 = row.get("size");
    let modified_at: Option<String> = row.get("modified_at");
    let track_number: Option<i64> = row.get("track_number");
    let disc_number: Option<i64> = row.get("disc_number");
    let bitrate_kbps: Option<i64> = row.get("bitrate_kbps");
    let sample_rate: Option<i64> = row.get("sample_rate");

    Ok(ScannedFile {
        id: Some(row.get("id")),
        path: PathBuf::from(path),
        size: size.max(0) as u64,
        content_hash: row.get("content_hash"),
        modified_at: modified_at.as_deref().map(parse_db_timestamp).transpose()?,
        tags: TagFields {
            artist: row.get("artist"),
            album_artist: row.get("album_artist"),
            album: row.get("album"),
            title: row.get("title"),
            track_number: track_number.and_then(|n| u32::try_from(n).ok()),
            disc_number: disc_number.and_then(|n| u32::try_from(n).ok()),
            year: row.get("year"),
            genre: row.get("genre"),
            duration_secs: row.get("duration_secs"),
            bitrate_kbps: bitrate_kbps.and_then(|n| u32::try_from(n).ok()),
            sample_rate: sample_rate.and_then(|n| u32::try_from(n).ok()),
        },
        is_valid: row.get("is_valid"),
        invalid_reason: row.get("invalid_reason"),
        group_hash: row.get("group_hash"),
        group_id: row.get("group_id"),
    })
}

/// Most frequent value; ties go to the lexicographically smallest
fn most_common<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a, count_a), (b, count_b)| count_a.cmp(count_b).then_with(|| b.cmp(a)))
        .map(|(value, _)| value.to_string())
}

fn summarize_group(group_id: String, members: &[ScannedFile]) -> AlbumGroup {
    let artist = most_common(members.iter().map(|f| {
        effective_artist(f.tags.artist.as_deref(), f.tags.album_artist.as_deref())
    }))
    .unwrap_or_default();
    let album = most_common(
        members
            .iter()
            .filter_map(|f| f.tags.album.as_deref())
            .map(str::trim)
            .filter(|a| !a.is_empty()),
    )
    .unwrap_or_default();

    let mut member_paths: Vec<PathBuf> = members.iter().map(|f| f.path.clone()).collect();
    member_paths.sort();

    AlbumGroup {
        group_hash: members
            .iter()
            .find_map(|f| f.group_hash.clone())
            .unwrap_or_default(),
        year: year_from_group_id(&group_id),
        group_id,
        artist,
        album,
        track_count: members.len(),
        total_size: members.iter().map(|f| f.size).sum(),
        member_paths,
    }
}
