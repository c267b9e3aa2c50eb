//! Catalog database initialization
//!
//! The catalog is the long-lived SQLite database shared by every tagshelf
//! component: artists and their directory codes, the job queue, and persisted
//! capacity probe state. Initialization is idempotent and safe to run on every
//! startup.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Current catalog schema version
pub const CATALOG_SCHEMA_VERSION: i64 = 1;

/// Setting key bounding how long lock-contended writes are retried
pub const SETTING_MAX_LOCK_WAIT_MS: &str = "database_max_lock_wait_ms";

/// Default for [`SETTING_MAX_LOCK_WAIT_MS`]
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Open (creating if needed) a SQLite database file with WAL and a busy timeout
///
/// Used for both the catalog and per-run staging stores.
pub async fn connect_sqlite(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(250));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    debug!(path = %db_path.display(), max_connections, "SQLite pool opened");
    Ok(pool)
}

/// Initialize the catalog database connection and create tables if needed
pub async fn init_catalog(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();
    let pool = connect_sqlite(db_path, 16).await?;

    if newly_created {
        info!("Initialized new catalog: {}", db_path.display());
    } else {
        info!("Opened existing catalog: {}", db_path.display());
    }

    create_catalog_schema(&pool).await?;
    Ok(pool)
}

/// Create every catalog table and index (idempotent)
pub async fn create_catalog_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_artists_table(pool).await?;
    create_artist_directory_codes_table(pool).await?;
    create_jobs_table(pool).await?;
    create_capacity_status_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(CATALOG_SCHEMA_VERSION)
        .execute(pool)
        .await?;

    ensure_setting(
        pool,
        SETTING_MAX_LOCK_WAIT_MS,
        &DEFAULT_MAX_LOCK_WAIT_MS.to_string(),
    )
    .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime key-value settings.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_artists_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            guid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_normalized TEXT NOT NULL UNIQUE,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// One code per artist; the NOCASE unique index is the final guard against
/// two sessions claiming the same code concurrently.
async fn create_artist_directory_codes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artist_directory_codes (
            artist_id TEXT PRIMARY KEY REFERENCES artists(guid) ON DELETE CASCADE,
            code TEXT NOT NULL,
            rule_version INTEGER NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_artist_directory_codes_code
        ON artist_directory_codes (code COLLATE NOCASE)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Job queue table
///
/// The partial unique index allows at most one live (pending, scheduled or
/// active) job per idempotency key.
async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            guid TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            queue TEXT NOT NULL,
            payload TEXT NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            run_at TEXT NOT NULL,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_live_key
        ON jobs (kind, subject_id)
        WHERE state IN ('pending', 'scheduled', 'active')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_queue_state ON jobs (queue, state, run_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_capacity_status_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS capacity_status (
            path TEXT PRIMARY KEY,
            used_percent REAL,
            status TEXT NOT NULL,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_probe_at TEXT,
            next_probe_at TEXT,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert a setting with its default value unless it already holds one
///
/// NULL values are reset to the default.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    match value {
        None => {
            // INSERT OR IGNORE: concurrent initializers may race past the lookup
            sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(default_value)
                .execute(pool)
                .await?;
            info!("Initialized setting '{}' with default value: {}", key, default_value);
        }
        Some(None) => {
            sqlx::query(
                "UPDATE settings SET value = ?, updated_at = CURRENT_TIMESTAMP WHERE key = ?",
            )
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;
            info!("Reset NULL setting '{}' to default value: {}", key, default_value);
        }
        Some(Some(_)) => {}
    }

    Ok(())
}

/// Read an integer setting, falling back to `default` when missing or unparsable
pub async fn get_setting_u64(pool: &SqlitePool, key: &str, default: u64) -> Result<u64> {
    let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    Ok(value
        .flatten()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default))
}

/// Maximum time lock-contended writes are retried for
pub async fn max_lock_wait_ms(pool: &SqlitePool) -> Result<u64> {
    get_setting_u64(pool, SETTING_MAX_LOCK_WAIT_MS, DEFAULT_MAX_LOCK_WAIT_MS).await
}
