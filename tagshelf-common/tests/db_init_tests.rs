//! Tests for catalog database initialization

use sqlx::Row;
use tagshelf_common::db::init::{
    ensure_setting, get_setting_u64, init_catalog, max_lock_wait_ms, CATALOG_SCHEMA_VERSION,
    DEFAULT_MAX_LOCK_WAIT_MS,
};
use tempfile::TempDir;

#[tokio::test]
async fn test_catalog_created_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("catalog.db");

    let pool = init_catalog(&db_path).await.unwrap();
    assert!(db_path.exists(), "Catalog file was not created");

    let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(version, CATALOG_SCHEMA_VERSION);
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("catalog.db");

    let first = init_catalog(&db_path).await.unwrap();
    sqlx::query("INSERT INTO artists (guid, name, name_normalized) VALUES ('a1', 'Low', 'low')")
        .execute(&first)
        .await
        .unwrap();
    first.close().await;

    let second = init_catalog(&db_path).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artists")
        .fetch_one(&second)
        .await
        .unwrap();
    assert_eq!(count, 1, "Re-initialization must not drop data");
}

#[tokio::test]
async fn test_expected_tables_exist() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_catalog(&temp_dir.path().join("catalog.db")).await.unwrap();

    let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
        .fetch_all(&pool)
        .await
        .unwrap();
    let tables: Vec<String> = rows.iter().map(|row| row.get("name")).collect();

    for table in [
        "schema_version",
        "settings",
        "artists",
        "artist_directory_codes",
        "jobs",
        "capacity_status",
    ] {
        assert!(tables.iter().any(|t| t == table), "missing table {}", table);
    }
}

#[tokio::test]
async fn test_directory_code_index_is_case_insensitive() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_catalog(&temp_dir.path().join("catalog.db")).await.unwrap();

    sqlx::query("INSERT INTO artists (guid, name, name_normalized) VALUES ('a1', 'One', 'one'), ('a2', 'Two', 'two')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO artist_directory_codes (artist_id, code, rule_version) VALUES ('a1', 'TB', 1)")
        .execute(&pool)
        .await
        .unwrap();

    let err = sqlx::query("INSERT INTO artist_directory_codes (artist_id, code, rule_version) VALUES ('a2', 'tb', 1)")
        .execute(&pool)
        .await
        .unwrap_err();
    assert!(tagshelf_common::Error::from(err).is_unique_violation());
}

#[tokio::test]
async fn test_live_job_key_is_unique_only_while_live() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_catalog(&temp_dir.path().join("catalog.db")).await.unwrap();

    let insert = |guid: &'static str, state: &'static str| {
        sqlx::query(
            "INSERT INTO jobs (guid, kind, subject_id, queue, payload, state, max_attempts, run_at, created_at, updated_at)
             VALUES (?, 'move', 'abc', 'default', '{}', ?, 5, 'now', 'now', 'now')",
        )
        .bind(guid)
        .bind(state)
    };

    insert("j1", "completed").execute(&pool).await.unwrap();
    insert("j2", "pending").execute(&pool).await.unwrap();
    assert!(insert("j3", "active").execute(&pool).await.is_err());
}

#[tokio::test]
async fn test_default_settings_initialized() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_catalog(&temp_dir.path().join("catalog.db")).await.unwrap();

    assert_eq!(max_lock_wait_ms(&pool).await.unwrap(), DEFAULT_MAX_LOCK_WAIT_MS);
}

#[tokio::test]
async fn test_ensure_setting_keeps_existing_and_resets_null() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_catalog(&temp_dir.path().join("catalog.db")).await.unwrap();

    ensure_setting(&pool, "probe_interval_secs", "600").await.unwrap();
    sqlx::query("UPDATE settings SET value = '30' WHERE key = 'probe_interval_secs'")
        .execute(&pool)
        .await
        .unwrap();
    ensure_setting(&pool, "probe_interval_secs", "600").await.unwrap();
    assert_eq!(get_setting_u64(&pool, "probe_interval_secs", 0).await.unwrap(), 30);

    sqlx::query("UPDATE settings SET value = NULL WHERE key = 'probe_interval_secs'")
        .execute(&pool)
        .await
        .unwrap();
    ensure_setting(&pool, "probe_interval_secs", "600").await.unwrap();
    assert_eq!(get_setting_u64(&pool, "probe_interval_secs", 0).await.unwrap(), 600);
}

#[tokio::test]
async fn test_unparsable_setting_falls_back_to_default() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_catalog(&temp_dir.path().join("catalog.db")).await.unwrap();

    ensure_setting(&pool, "batch", "not-a-number").await.unwrap();
    assert_eq!(get_setting_u64(&pool, "batch", 42).await.unwrap(), 42);
}
