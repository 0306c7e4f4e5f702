//! Load and write protocol tests for the checkpoint store

use chrono::{DateTime, Duration, Utc};
use iotswarm_core::IotSwarmError;
use iotswarm_state::{codec, CheckpointStore, Snapshot, StatePaths, UpdateOutcome};
use proptest::prelude::*;
use std::path::Path;

fn read_snapshot(path: &Path) -> Snapshot {
    codec::decode(&std::fs::read(path).unwrap()).unwrap()
}

/// No files at all is a first run
#[tokio::test]
async fn test_missing_files_start_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open(dir.path().join("nested"), "live")
        .await
        .unwrap();

    assert!(store.snapshot().await.is_empty());
    assert!(store.get("T1", "S1").await.is_none());
    assert!(!store.paths().primary.exists());
}

/// State survives a reopen
#[tokio::test]
async fn test_updates_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();

    {
        let store = CheckpointStore::open(dir.path(), "live").await.unwrap();
        store.update("T1", "S1", now - Duration::hours(1)).await.unwrap();
        store.update("T1", "S2", now).await.unwrap();
        store.update("T2", "S1", now).await.unwrap();
    }

    let store = CheckpointStore::open(dir.path(), "live").await.unwrap();
    assert_eq!(
        store.get("T1", "S1").await.unwrap().last_timestamp,
        now - Duration::hours(1)
    );
    let sites: Vec<_> = store
        .records("T1")
        .await
        .into_iter()
        .map(|r| r.site_id)
        .collect();
    assert_eq!(sites, vec!["S1", "S2"]);
}

/// The backup always holds the snapshot before the latest write
#[tokio::test]
async fn test_backup_holds_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open(dir.path(), "live").await.unwrap();
    let now = Utc::now();

    store.update("T1", "S1", now - Duration::hours(2)).await.unwrap();
    assert!(read_snapshot(&store.paths().backup).is_empty());

    let first = store.snapshot().await;
    store.update("T1", "S1", now).await.unwrap();

    assert_eq!(read_snapshot(&store.paths().backup), first);
    assert_eq!(read_snapshot(&store.paths().primary), store.snapshot().await);
}

/// A damaged primary falls back to the backup and is repaired
#[tokio::test]
async fn test_corrupt_primary_recovers_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let paths = StatePaths::in_dir(dir.path(), "live");

    {
        let store = CheckpointStore::open_paths(paths.clone()).await.unwrap();
        store.update("T1", "S1", now - Duration::hours(2)).await.unwrap();
        store.update("T1", "S1", now).await.unwrap();
    }
    let backup = read_snapshot(&paths.backup);
    std::fs::write(&paths.primary, b"not a checkpoint").unwrap();

    let store = CheckpointStore::open_paths(paths.clone()).await.unwrap();

    assert_eq!(store.snapshot().await, backup);
    assert_eq!(
        store.get("T1", "S1").await.unwrap().last_timestamp,
        now - Duration::hours(2)
    );
    assert_eq!(read_snapshot(&paths.primary), backup);

    // Writes continue normally after the repair
    store.update("T1", "S1", now).await.unwrap();
    assert_eq!(read_snapshot(&paths.primary), store.snapshot().await);
    assert_eq!(read_snapshot(&paths.backup), backup);
}

/// A missing primary with a valid backup is restored as well
#[tokio::test]
async fn test_missing_primary_recovers_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let paths = StatePaths::in_dir(dir.path(), "live");

    {
        let store = CheckpointStore::open_paths(paths.clone()).await.unwrap();
        store.update("T1", "S1", now - Duration::hours(1)).await.unwrap();
        store.update("T1", "S2", now).await.unwrap();
    }
    std::fs::remove_file(&paths.primary).unwrap();

    let store = CheckpointStore::open_paths(paths.clone()).await.unwrap();
    assert!(store.get("T1", "S1").await.is_some());
    assert!(store.get("T1", "S2").await.is_none());
    assert!(paths.primary.exists());
}

/// Both copies damaged is fatal, distinct from a first run
#[tokio::test]
async fn test_both_corrupt_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StatePaths::in_dir(dir.path(), "live");
    std::fs::write(&paths.primary, b"garbage").unwrap();
    std::fs::write(&paths.backup, b"more garbage").unwrap();

    let err = CheckpointStore::open_paths(paths).await.unwrap_err();
    assert!(matches!(err, IotSwarmError::StateCorruption(_)), "{err:?}");
}

/// A lone damaged backup is also unrecoverable
#[tokio::test]
async fn test_corrupt_backup_without_primary_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StatePaths::in_dir(dir.path(), "live");
    std::fs::write(&paths.backup, b"garbage").unwrap();

    let err = CheckpointStore::open_paths(paths).await.unwrap_err();
    assert!(matches!(err, IotSwarmError::StateCorruption(_)));
}

/// A valid primary wins even when the backup is damaged
#[tokio::test]
async fn test_valid_primary_ignores_damaged_backup() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let paths = StatePaths::in_dir(dir.path(), "live");

    {
        let store = CheckpointStore::open_paths(paths.clone()).await.unwrap();
        store.update("T1", "S1", now).await.unwrap();
    }
    std::fs::write(&paths.backup, b"garbage").unwrap();

    let store = CheckpointStore::open_paths(paths).await.unwrap();
    assert_eq!(store.get("T1", "S1").await.unwrap().last_timestamp, now);
}

/// A failed write leaves the committed state in place
#[tokio::test]
async fn test_failed_write_keeps_committed_state() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    // The backup slot is a directory, so rotating into it fails
    let paths = StatePaths {
        primary: dir.path().join("live.ckpt"),
        backup: dir.path().join("blocked"),
    };
    std::fs::create_dir(&paths.backup).unwrap();
    std::fs::write(paths.backup.join("keep"), b"x").unwrap();

    let store = CheckpointStore::open_paths(paths.clone()).await.unwrap();
    let err = store.update("T1", "S1", now).await.unwrap_err();

    assert!(matches!(err, IotSwarmError::StateWrite(_)), "{err:?}");
    assert!(store.get("T1", "S1").await.is_none());
    assert!(!paths.primary.exists());
}

/// Concurrent updates to one pair converge on the maximum
#[tokio::test]
async fn test_concurrent_updates_keep_maximum() {
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(CheckpointStore::open(dir.path(), "live").await.unwrap());
    let base = Utc::now();

    let mut handles = Vec::new();
    for offset in [5, 1, 9, 3, 7] {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .update("T1", "S1", base + Duration::seconds(offset))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let expected = base + Duration::seconds(9);
    assert_eq!(store.get("T1", "S1").await.unwrap().last_timestamp, expected);
    assert_eq!(
        read_snapshot(&store.paths().primary)
            .get("T1", "S1")
            .unwrap()
            .last_timestamp,
        expected
    );
}

fn timestamp(offset_secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// The stored timestamp never decreases and ends at the maximum candidate
    #[test]
    fn prop_checkpoint_is_monotonic(offsets in proptest::collection::vec(0i64..10_000, 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = CheckpointStore::open(dir.path(), "prop").await.unwrap();
            let mut seen: Option<DateTime<Utc>> = None;

            for offset in &offsets {
                let candidate = timestamp(*offset);
                let outcome = store.update("T1", "S1", candidate).await.unwrap();
                let stored = store.get("T1", "S1").await.unwrap().last_timestamp;

                if let Some(previous) = seen {
                    prop_assert!(stored >= previous);
                    prop_assert_eq!(outcome.is_advanced(), candidate > previous);
                }
                seen = Some(stored);
            }

            let max = offsets.iter().copied().max().map(timestamp);
            prop_assert_eq!(seen, max);

            let reopened = CheckpointStore::open(dir.path(), "prop").await.unwrap();
            prop_assert_eq!(reopened.get("T1", "S1").await.map(|r| r.last_timestamp), max);
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[test]
fn test_update_outcome_helpers() {
    assert!(UpdateOutcome::Advanced { previous: None }.is_advanced());
    assert!(!UpdateOutcome::Unchanged.is_advanced());
}
