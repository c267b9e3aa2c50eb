//! Capacity status persistence

use crate::models::{CapacityLevel, CapacityStatus};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use tagshelf_common::time::{parse_db_timestamp, to_db_timestamp};
use tagshelf_common::{Error, Result};

/// Insert or replace the stored status for a path
pub async fn upsert_status(pool: &SqlitePool, status: &CapacityStatus) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO capacity_status
            (path, used_percent, status, consecutive_failures, last_probe_at, next_probe_at, last_error)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            used_percent = excluded.used_percent,
            status = excluded.status,
            consecutive_failures = excluded.consecutive_failures,
            last_probe_at = excluded.last_probe_at,
            next_probe_at = excluded.next_probe_at,
            last_error = excluded.last_error
        "#,
    )
    .bind(status.path.to_string_lossy().to_string())
    .bind(status.used_percent)
    .bind(status.status.as_str())
    .bind(status.consecutive_failures as i64)
    .bind(status.last_probe_at.map(to_db_timestamp))
    .bind(status.next_probe_at.map(to_db_timestamp))
    .bind(&status.last_error)
    .execute(pool)
    .await?;

    Ok(())
}

/// Every stored status, ordered by path
pub async fn load_statuses(pool: &SqlitePool) -> Result<Vec<CapacityStatus>> {
    let rows = sqlx::query(
        r#"
        SELECT path, used_percent, status, consecutive_failures, last_probe_at, next_probe_at, last_error
        FROM capacity_status
        ORDER BY path
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let path: String = row.get("path");
            let status: String = row.get("status");
            let failures: i64 = row.get("consecutive_failures");
            let last_probe_at: Option<String> = row.get("last_probe_at");
            let next_probe_at: Option<String> = row.get("next_probe_at");

            Ok(CapacityStatus {
                path: PathBuf::from(path),
                used_percent: row.get("used_percent"),
                status: status.parse::<CapacityLevel>().map_err(Error::Internal)?,
                consecutive_failures: failures.max(0) as u32,
                last_probe_at: last_probe_at.as_deref().map(parse_db_timestamp).transpose()?,
                next_probe_at: next_probe_at.as_deref().map(parse_db_timestamp).transpose()?,
                last_error: row.get("last_error"),
            })
        })
        .collect()
}
