//! Artist directory code persistence
//!
//! The NOCASE unique index on `code` is the final guard against two sessions
//! claiming the same code; callers re-check inside the claiming transaction.

use sqlx::{Row, SqliteConnection, SqlitePool};
use tagshelf_common::{Error, Result};
use uuid::Uuid;

/// Stored code for one artist
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ArtistDirectoryCode {
    pub artist_id: Uuid,
    pub code: String,
    pub rule_version: i64,
}

/// Code stored for an artist, if any
pub async fn code_for_artist(pool: &SqlitePool, artist_id: Uuid) -> Result<Option<ArtistDirectoryCode>> {
    let mut conn = pool.acquire().await?;
    code_for_artist_conn(&mut conn, artist_id).await
}

/// [`code_for_artist`] on an open connection or transaction
pub async fn code_for_artist_conn(
    conn: &mut SqliteConnection,
    artist_id: Uuid,
) -> Result<Option<ArtistDirectoryCode>> {
    let row = sqlx::query(
        "SELECT artist_id, code, rule_version FROM artist_directory_codes WHERE artist_id = ?",
    )
    .bind(artist_id.to_string())
    .fetch_optional(conn)
    .await?;

    row.map(|row| code_from_row(&row)).transpose()
}

/// Owner of a code (case-insensitive), excluding `exclude_artist`
pub async fn code_owner(
    conn: &mut SqliteConnection,
    code: &str,
    exclude_artist: Uuid,
) -> Result<Option<Uuid>> {
    let owner: Option<String> = sqlx::query_scalar(
        "SELECT artist_id FROM artist_directory_codes WHERE code = ? COLLATE NOCASE AND artist_id != ?",
    )
    .bind(code)
    .bind(exclude_artist.to_string())
    .fetch_optional(conn)
    .await?;

    owner
        .map(|id| {
            Uuid::parse_str(&id)
                .map_err(|e| Error::Internal(format!("Invalid artist id '{}': {}", id, e)))
        })
        .transpose()
}

/// Insert a code for an artist that has none
pub async fn insert_code(conn: &mut SqliteConnection, code: &ArtistDirectoryCode) -> Result<()> {
    sqlx::query(
        "INSERT INTO artist_directory_codes (artist_id, code, rule_version) VALUES (?, ?, ?)",
    )
    .bind(code.artist_id.to_string())
    .bind(&code.code)
    .bind(code.rule_version)
    .execute(conn)
    .await?;
    Ok(())
}

/// Insert or replace an artist's code (manual override)
pub async fn upsert_code(conn: &mut SqliteConnection, code: &ArtistDirectoryCode) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO artist_directory_codes (artist_id, code, rule_version) VALUES (?, ?, ?)
        ON CONFLICT(artist_id) DO UPDATE SET
            code = excluded.code,
            rule_version = excluded.rule_version,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(code.artist_id.to_string())
    .bind(&code.code)
    .bind(code.rule_version)
    .execute(conn)
    .await?;
    Ok(())
}

/// Every stored code, ordered by code
pub async fn list_codes(pool: &SqlitePool) -> Result<Vec<ArtistDirectoryCode>> {
    let rows = sqlx::query(
        "SELECT artist_id, code, rule_version FROM artist_directory_codes ORDER BY code",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(code_from_row).collect()
}

fn code_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ArtistDirectoryCode> {
    let artist_id: String = row.get("artist_id");
    Ok(ArtistDirectoryCode {
        artist_id: Uuid::parse_str(&artist_id)
            .map_err(|e| Error::Internal(format!("Invalid artist id '{}': {}", artist_id, e)))?,
        code: row.get("code"),
        rule_version: row.get("rule_version"),
    })
}
