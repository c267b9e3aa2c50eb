//! Directory code assignment against a real catalog

mod helpers;

use futures::future::join_all;
use helpers::test_catalog;
use std::collections::HashSet;
use tagshelf_ingest::config::DirectoryCodeConfig;
use tagshelf_ingest::db::artists::ensure_artist;
use tagshelf_ingest::db::directory_codes::list_codes;
use tagshelf_ingest::services::directory_codes::{
    CodeError, DirectoryCodeGenerator, DirectoryCodeSession, MANUAL_RULE_VERSION,
};

fn session(pool: sqlx::SqlitePool) -> DirectoryCodeSession {
    let generator = DirectoryCodeGenerator::new(DirectoryCodeConfig::default()).unwrap();
    DirectoryCodeSession::new(pool, generator)
}

#[tokio::test]
async fn test_collisions_take_numeric_suffix() {
    let catalog = test_catalog().await;
    let codes = session(catalog.pool.clone());

    let zeppelin = ensure_artist(&catalog.pool, "Led Zeppelin").await.unwrap();
    let beatles = ensure_artist(&catalog.pool, "The Beatles").await.unwrap();
    let bunnymen = ensure_artist(&catalog.pool, "The Bunnymen").await.unwrap();

    let lz = codes.code_for_artist(zeppelin.guid, &zeppelin.name).await.unwrap();
    let tb = codes.code_for_artist(beatles.guid, &beatles.name).await.unwrap();
    let tb2 = codes.code_for_artist(bunnymen.guid, &bunnymen.name).await.unwrap();

    assert_eq!(lz.code, "LZ");
    assert_eq!(tb.code, "TB");
    assert_eq!(tb2.code, "TB-2");
    assert_eq!(tb2.rule_version, 1);
}

#[tokio::test]
async fn test_existing_code_is_returned_unchanged() {
    let catalog = test_catalog().await;
    let codes = session(catalog.pool.clone());
    let artist = ensure_artist(&catalog.pool, "Radiohead").await.unwrap();

    let first = codes.code_for_artist(artist.guid, &artist.name).await.unwrap();
    let second = codes.code_for_artist(artist.guid, &artist.name).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(list_codes(&catalog.pool).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_artist_lookup_is_by_normalized_name() {
    let catalog = test_catalog().await;
    let a = ensure_artist(&catalog.pool, "Pink Floyd").await.unwrap();
    let b = ensure_artist(&catalog.pool, "  pink   FLOYD ").await.unwrap();
    assert_eq!(a.guid, b.guid);
    assert_eq!(b.name, "Pink Floyd");
}

#[tokio::test]
async fn test_concurrent_sessions_never_share_a_code() {
    let catalog = test_catalog().await;

    // Every name has base code "TB"
    let names = [
        "The Beatles",
        "The Byrds",
        "Talk Box",
        "Tom Baker",
        "Tame Birds",
        "Two Bees",
        "Tin Bell",
        "True Blue",
    ];
    let mut artists = Vec::new();
    for name in names {
        artists.push(ensure_artist(&catalog.pool, name).await.unwrap());
    }

    let results = join_all(artists.iter().map(|artist| {
        // One session per task, as separate processes would have
        let codes = session(catalog.pool.clone());
        async move { codes.code_for_artist(artist.guid, &artist.name).await }
    }))
    .await;

    let assigned: Vec<String> = results.into_iter().map(|r| r.unwrap().code).collect();
    let unique: HashSet<&String> = assigned.iter().collect();
    assert_eq!(unique.len(), names.len(), "duplicate codes: {:?}", assigned);
    assert!(assigned.contains(&"TB".to_string()));
    for code in &assigned {
        assert!(code == "TB" || code.starts_with("TB-"), "unexpected code {}", code);
    }
}

#[tokio::test]
async fn test_collision_bound_fails_explicitly() {
    let catalog = test_catalog().await;
    let config = DirectoryCodeConfig {
        max_collisions: 2,
        ..Default::default()
    };
    let codes = DirectoryCodeSession::new(
        catalog.pool.clone(),
        DirectoryCodeGenerator::new(config).unwrap(),
    );

    for name in ["The Beatles", "The Byrds"] {
        let artist = ensure_artist(&catalog.pool, name).await.unwrap();
        codes.code_for_artist(artist.guid, &artist.name).await.unwrap();
    }

    let third = ensure_artist(&catalog.pool, "Tom Baker").await.unwrap();
    let err = codes.code_for_artist(third.guid, &third.name).await.unwrap_err();
    assert!(matches!(err, CodeError::CollisionLimit { attempts: 2, .. }));
}

#[tokio::test]
async fn test_manual_override() {
    let catalog = test_catalog().await;
    let codes = session(catalog.pool.clone());
    let beatles = ensure_artist(&catalog.pool, "The Beatles").await.unwrap();
    let byrds = ensure_artist(&catalog.pool, "The Byrds").await.unwrap();
    codes.code_for_artist(beatles.guid, &beatles.name).await.unwrap();

    let overridden = codes.override_code(byrds.guid, "byrd").await.unwrap();
    assert_eq!(overridden.code, "BYRD");
    assert_eq!(overridden.rule_version, MANUAL_RULE_VERSION);
    assert_eq!(codes.lookup(byrds.guid).await.unwrap(), Some(overridden));

    // Taken by another artist, case-insensitively
    let err = codes.override_code(byrds.guid, "tb").await.unwrap_err();
    assert!(matches!(err, CodeError::Taken(_)));

    let err = codes.override_code(byrds.guid, "no spaces").await.unwrap_err();
    assert!(matches!(err, CodeError::Invalid { .. }));
}
