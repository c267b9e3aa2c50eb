//! Artist catalog operations
//!
//! Artists are keyed by a normalized name (lowercase, whitespace collapsed) so
//! "Pink Floyd" and "pink  floyd" resolve to the same row.

use sqlx::{Row, SqlitePool};
use tagshelf_common::{Error, Result};
use uuid::Uuid;

/// Artist record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artist {
    pub guid: Uuid,
    pub name: String,
    pub name_normalized: String,
}

/// Catalog lookup key for an artist name
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Look up an artist by name, creating it if missing
pub async fn ensure_artist(pool: &SqlitePool, name: &str) -> Result<Artist> {
    let name_normalized = normalize_name(name);
    if name_normalized.is_empty() {
        return Err(Error::InvalidInput("Artist name is empty".to_string()));
    }

    if let Some(artist) = load_artist_by_normalized(pool, &name_normalized).await? {
        return Ok(artist);
    }

    // OR IGNORE: a concurrent caller may insert the same name first
    sqlx::query(
        "INSERT OR IGNORE INTO artists (guid, name, name_normalized) VALUES (?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(name.trim())
    .bind(&name_normalized)
    .execute(pool)
    .await?;

    load_artist_by_normalized(pool, &name_normalized)
        .await?
        .ok_or_else(|| Error::Internal(format!("Artist '{}' missing after insert", name)))
}

/// Load artist by normalized name
pub async fn load_artist_by_normalized(
    pool: &SqlitePool,
    name_normalized: &str,
) -> Result<Option<Artist>> {
    let row = sqlx::query("SELECT guid, name, name_normalized FROM artists WHERE name_normalized = ?")
        .bind(name_normalized)
        .fetch_optional(pool)
        .await?;

    row.map(|row| artist_from_row(&row)).transpose()
}

/// Load artist by id
pub async fn load_artist(pool: &SqlitePool, guid: Uuid) -> Result<Option<Artist>> {
    let row = sqlx::query("SELECT guid, name, name_normalized FROM artists WHERE guid = ?")
        .bind(guid.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|row| artist_from_row(&row)).transpose()
}

fn artist_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Artist> {
    let guid: String = row.get("guid");
    Ok(Artist {
        guid: Uuid::parse_str(&guid)
            .map_err(|e| Error::Internal(format!("Invalid artist guid '{}': {}", guid, e)))?,
        name: row.get("name"),
        name_normalized: row.get("name_normalized"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Pink   Floyd "), "pink floyd");
        assert_eq!(normalize_name(""), "");
    }
}
