//! Scanner → staging store → grouping integration tests

mod helpers;

use helpers::{scanner_config, tag_reader, write_corrupt, write_track, Track};
use tagshelf_ingest::db::staging::StagingStore;
use tagshelf_ingest::services::album_grouping::{AlbumGroupingEngine, YearTieBreak};
use tagshelf_ingest::services::file_scanner::{FileScanner, ScanError};
use tagshelf_ingest::services::fingerprinter::ContentFingerprinter;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn scanner() -> FileScanner {
    FileScanner::new(scanner_config(), ContentFingerprinter::new(tag_reader()))
}

#[tokio::test]
async fn test_corrupt_files_do_not_abort_the_run() {
    let inbound = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();

    // 990 valid files with 10 corrupt ones interleaved
    for i in 0..1000u32 {
        let dir = format!("album_{:02}", i / 50);
        if i % 100 == 50 {
            write_corrupt(inbound.path(), &format!("{}/broken_{}.mp3", dir, i));
        } else {
            let track = Track::new("Low", "Trust", i % 50 + 1, Some(2002));
            write_track(inbound.path(), &format!("{}/{:04}.flac", dir, i), &track);
        }
    }

    let store = StagingStore::create(staging.path(), "scan_test").await.unwrap();
    let stats = scanner()
        .scan(inbound.path(), &store, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.files_discovered, 1000);
    assert_eq!(stats.files_valid, 990);
    assert_eq!(stats.files_invalid, 10);
    assert!(!stats.cancelled);
    assert_eq!(store.counts().await.unwrap(), (990, 10));

    let invalid = store.invalid_files().await.unwrap();
    assert_eq!(invalid.len(), 10);
    for file in &invalid {
        let reason = file.invalid_reason.as_deref().unwrap();
        assert!(reason.starts_with("tag parse failed"), "unexpected reason {}", reason);
    }
}

#[tokio::test]
async fn test_missing_tags_are_invalid_but_visible() {
    let inbound = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();

    let mut untitled = Track::new("Low", "Trust", 1, Some(2002));
    untitled.title = String::new();
    write_track(inbound.path(), "a.flac", &untitled);
    write_track(inbound.path(), "b.flac", &Track::new("Low", "Trust", 2, Some(2002)));
    // Not media: never staged
    std::fs::write(inbound.path().join("cover.jpg"), b"jpeg").unwrap();

    let store = StagingStore::create(staging.path(), "scan_tags").await.unwrap();
    let stats = scanner()
        .scan(inbound.path(), &store, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.files_discovered, 2);
    let invalid = store.invalid_files().await.unwrap();
    assert_eq!(invalid.len(), 1);
    assert_eq!(
        invalid[0].invalid_reason.as_deref(),
        Some("missing required tags: title")
    );
}

#[tokio::test]
async fn test_ignore_patterns_skip_entries() {
    let inbound = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();

    write_track(inbound.path(), "keep/01.flac", &Track::new("Low", "Trust", 1, None));
    write_track(inbound.path(), "@eaDir/01.flac", &Track::new("Low", "Trust", 1, None));
    write_track(inbound.path(), ".git/objects/x.mp3", &Track::new("Low", "Trust", 1, None));

    let store = StagingStore::create(staging.path(), "scan_ignore").await.unwrap();
    let stats = scanner()
        .scan(inbound.path(), &store, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.files_discovered, 1);
    let files = store.files().await.unwrap();
    assert!(files[0].path.ends_with("keep/01.flac"));
}

#[tokio::test]
async fn test_root_validation() {
    let staging = TempDir::new().unwrap();
    let store = StagingStore::create(staging.path(), "scan_root").await.unwrap();

    let missing = staging.path().join("does-not-exist");
    let err = scanner()
        .scan(&missing, &store, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::PathNotFound(_)));

    let file = staging.path().join("plain.txt");
    std::fs::write(&file, b"x").unwrap();
    let err = scanner()
        .scan(&file, &store, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::NotADirectory(_)));
}

#[tokio::test]
async fn test_cancelled_scan_reports_cancellation() {
    let inbound = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    for i in 0..20 {
        write_track(inbound.path(), &format!("{}.flac", i), &Track::new("Low", "Trust", i, None));
    }

    let store = StagingStore::create(staging.path(), "scan_cancel").await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let stats = scanner().scan(inbound.path(), &store, cancel).await.unwrap();

    assert!(stats.cancelled);
    let (valid, invalid) = store.counts().await.unwrap();
    assert_eq!(valid + invalid, stats.files_valid + stats.files_invalid);
}

#[tokio::test]
async fn test_staging_store_cannot_be_created_twice() {
    let staging = TempDir::new().unwrap();
    let store = StagingStore::create(staging.path(), "scan_dup").await.unwrap();
    store.close().await;

    assert!(StagingStore::create(staging.path(), "scan_dup").await.is_err());

    let reopened = StagingStore::open(&staging.path().join("scan_dup.db"))
        .await
        .unwrap();
    assert_eq!(reopened.scan_id(), "scan_dup");
}

#[tokio::test]
async fn test_remaster_variants_merge_into_one_group() {
    let inbound = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();

    write_track(
        inbound.path(),
        "remaster/01.flac",
        &Track::new("Pink Floyd", "The Wall (Remastered)", 1, Some(1979)),
    );
    write_track(
        inbound.path(),
        "original/02.flac",
        &Track::new("Pink Floyd", "the wall", 2, Some(1979)),
    );
    // Second year on a minority track does not split the group
    write_track(
        inbound.path(),
        "original/03.flac",
        &Track::new("Pink Floyd", "The Wall", 3, Some(2011)),
    );
    write_track(
        inbound.path(),
        "other/01.flac",
        &Track::new("Pink Floyd", "Animals", 1, None),
    );

    let store = StagingStore::create(staging.path(), "scan_group").await.unwrap();
    scanner()
        .scan(inbound.path(), &store, CancellationToken::new())
        .await
        .unwrap();

    let summary = AlbumGroupingEngine::new(YearTieBreak::MostRecent)
        .run(&store)
        .await
        .unwrap();
    assert_eq!(summary.records, 4);
    assert_eq!(summary.groups, 2);

    let groups = store.album_groups().await.unwrap();
    let wall = groups
        .iter()
        .find(|g| g.group_id == "pink floyd::wall_1979")
        .expect("wall group");
    assert_eq!(wall.track_count, 3);
    assert_eq!(wall.year, Some(1979));
    assert_eq!(wall.artist, "Pink Floyd");
    assert_eq!(wall.group_hash.len(), 16);

    let animals = groups
        .iter()
        .find(|g| g.group_id == "pink floyd::animals_unknown")
        .expect("animals group");
    assert_eq!(animals.track_count, 1);
    assert_eq!(animals.year, None);
}

#[tokio::test]
async fn test_grouping_is_deterministic_across_runs() {
    let inbound = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    for i in 1..=6 {
        write_track(
            inbound.path(),
            &format!("{}.flac", i),
            &Track::new("Low", "Trust", i, Some(if i % 2 == 0 { 2002 } else { 2003 })),
        );
    }

    let mut ids = Vec::new();
    for run in 0..2 {
        let store = StagingStore::create(staging.path(), &format!("scan_run{}", run))
            .await
            .unwrap();
        scanner()
            .scan(inbound.path(), &store, CancellationToken::new())
            .await
            .unwrap();
        AlbumGroupingEngine::default().run(&store).await.unwrap();
        let groups = store.album_groups().await.unwrap();
        ids.push(
            groups
                .iter()
                .map(|g| (g.group_id.clone(), g.group_hash.clone()))
                .collect::<Vec<_>>(),
        );
        store.close().await;
    }

    assert_eq!(ids[0], ids[1]);
    // 3 vs 3: tie goes to the more recent year
    assert_eq!(ids[0][0].0, "low::trust_2003");
}
