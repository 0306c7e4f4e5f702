//! End-to-end tests of live upload passes against in-memory collaborators

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use iotswarm_core::{
    CancellationToken, DeviceProfile, IotSwarmError, IotSwarmResult, MemoryDataSource, MemorySink,
    Payload, Record, RetryPolicy, Sink,
};
use iotswarm_live::{LiveUploadConfig, LiveUploader, PairOutcome, Selection};
use iotswarm_state::{CheckpointStore, StatePaths};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tempfile::TempDir;

const T1: &str = "T1";

fn config() -> LiveUploadConfig {
    LiveUploadConfig {
        permitted_tables: vec![T1.to_string(), "T2".to_string()],
        max_concurrent_pairs: 1,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            jitter_factor: 0.0,
            operation_timeout_ms: 1_000,
            ..RetryPolicy::default()
        },
        ..LiveUploadConfig::default()
    }
}

fn reading(at: DateTime<Utc>) -> Record {
    Record::new(at)
        .with_value("ta_avg", 10.5)
        .with_value("battv", 12.7)
}

async fn store(dir: &TempDir) -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::open(dir.path(), "live").await.unwrap())
}

fn uploader(
    source: &Arc<MemoryDataSource>,
    sink: Arc<dyn Sink>,
    store: &Arc<CheckpointStore>,
    config: LiveUploadConfig,
) -> LiveUploader {
    LiveUploader::new(
        source.clone(),
        sink,
        store.clone(),
        config,
        DeviceProfile::default(),
    )
    .unwrap()
}

fn only(values: &[&str]) -> Selection {
    Selection::from_args(values.iter().copied())
}

/// Without a checkpoint only records inside the fallback window are sent
#[tokio::test]
async fn test_fallback_window_limits_first_upload() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let source = Arc::new(MemoryDataSource::from_records([
        (T1, "S1", reading(now - Duration::hours(2))),
        (T1, "S1", reading(now - Duration::hours(4))),
    ]));
    let sink = Arc::new(MemorySink::new());
    let store = store(&dir).await;

    let report = uploader(&source, sink.clone(), &store, config())
        .run_at(&only(&[T1]), &Selection::All, 3, now)
        .await
        .unwrap();

    let pair = report.find(T1, "S1").unwrap();
    assert_eq!(pair.since, now - Duration::hours(3));
    assert_eq!(
        pair.outcome,
        PairOutcome::Forwarded {
            records: 1,
            payloads: 1,
            checkpoint: now - Duration::hours(2),
        }
    );

    let messages = sink.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "live/T1/S1");
    assert_eq!(messages[0].payload.data[0].time, now - Duration::hours(2));
    assert_eq!(messages[0].payload.head.environment.table_name, T1);

    assert_eq!(
        store.get(T1, "S1").await.unwrap().last_timestamp,
        now - Duration::hours(2)
    );
}

/// An existing checkpoint overrides the fallback window
#[tokio::test]
async fn test_checkpoint_bounds_fetch_and_advances() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let source = Arc::new(MemoryDataSource::from_records([
        (T1, "S1", reading(now - Duration::hours(1))),
        (T1, "S1", reading(now - Duration::hours(3))),
        (T1, "S1", reading(now - Duration::hours(6))),
    ]));
    let sink = Arc::new(MemorySink::new());
    let store = store(&dir).await;
    store.update(T1, "S1", now - Duration::hours(5)).await.unwrap();

    let report = uploader(&source, sink.clone(), &store, config())
        .run_at(&only(&[T1]), &only(&["S1"]), 3, now)
        .await
        .unwrap();

    assert_eq!(report.forwarded_records(), 2);
    let times: Vec<_> = sink
        .messages()
        .await
        .iter()
        .map(|m| m.payload.data[0].time)
        .collect();
    assert_eq!(
        times,
        vec![now - Duration::hours(3), now - Duration::hours(1)]
    );
    assert_eq!(
        store.get(T1, "S1").await.unwrap().last_timestamp,
        now - Duration::hours(1)
    );
}

/// A second pass over unchanged data sends nothing
#[tokio::test]
async fn test_rerun_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let source = Arc::new(MemoryDataSource::from_records([
        (T1, "S1", reading(now - Duration::hours(1))),
        (T1, "S2", reading(now - Duration::minutes(30))),
    ]));
    let sink = Arc::new(MemorySink::new());
    let store = store(&dir).await;
    let uploader = uploader(&source, sink.clone(), &store, config());

    let first = uploader
        .run_at(&only(&[T1]), &Selection::All, 3, now)
        .await
        .unwrap();
    assert_eq!(first.forwarded_records(), 2);
    let checkpoints = store.snapshot().await;

    let second = uploader
        .run_at(&only(&[T1]), &Selection::All, 3, now)
        .await
        .unwrap();

    assert_eq!(second.forwarded_records(), 0);
    assert_eq!(second.skipped(), 2);
    assert_eq!(sink.published_count().await, 2);
    assert_eq!(store.snapshot().await, checkpoints);
}

/// A failed publish leaves that pair's checkpoint alone and others proceed
#[tokio::test]
async fn test_publish_failure_keeps_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let source = Arc::new(MemoryDataSource::from_records([
        (T1, "S1", reading(now - Duration::hours(1))),
        (T1, "S2", reading(now - Duration::hours(1))),
    ]));
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(1, IotSwarmError::auth("access denied")).await;
    let store = store(&dir).await;

    let report = uploader(&source, sink.clone(), &store, config())
        .run_at(&only(&[T1]), &only(&["S1", "S2"]), 3, now)
        .await
        .unwrap();

    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.find(T1, "S1").unwrap().outcome,
        PairOutcome::Failed { records: 0, .. }
    ));
    assert!(store.get(T1, "S1").await.is_none());
    assert!(store.get(T1, "S2").await.is_some());

    let errors = report.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "T1/S1");
    assert_eq!(errors[0].1, IotSwarmError::auth("access denied"));
}

/// Transient publish failures exhaust the retry budget and fail the pair
#[tokio::test]
async fn test_exhausted_retries_fail_pair() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let source = Arc::new(MemoryDataSource::from_records([(
        T1,
        "S1",
        reading(now - Duration::hours(1)),
    )]));
    let sink = Arc::new(MemorySink::new());
    sink.fail_always(IotSwarmError::publish("throttled")).await;
    let store = store(&dir).await;

    let report = uploader(&source, sink.clone(), &store, config())
        .run_at(&only(&[T1]), &only(&["S1"]), 3, now)
        .await
        .unwrap();

    assert_eq!(sink.attempts(), 3);
    match &report.find(T1, "S1").unwrap().outcome {
        PairOutcome::Failed { error, .. } => {
            assert!(matches!(error, IotSwarmError::RetriesExhausted { attempts: 3, .. }))
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(store.snapshot().await.is_empty());
}

/// Fails every call after the first `ok` ones with a permanent error
struct FailAfter {
    ok: usize,
    calls: AtomicUsize,
    inner: MemorySink,
}

#[async_trait]
impl Sink for FailAfter {
    fn name(&self) -> &str {
        "fail-after"
    }

    async fn publish(&self, topic: &str, payload: &Payload) -> IotSwarmResult<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok {
            return Err(IotSwarmError::auth("quota exceeded"));
        }
        self.inner.publish(topic, payload).await
    }
}

/// Batches advance the checkpoint chunk by chunk and stop at the first failure
#[tokio::test]
async fn test_batches_checkpoint_per_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let source = Arc::new(MemoryDataSource::from_records(
        (1..=5).map(|i| (T1, "S1", reading(now - Duration::minutes(i * 10)))),
    ));
    let sink = Arc::new(FailAfter {
        ok: 1,
        calls: AtomicUsize::new(0),
        inner: MemorySink::new(),
    });
    let store = store(&dir).await;
    let config = LiveUploadConfig {
        batch_size: 2,
        ..config()
    };

    let report = uploader(&source, sink.clone(), &store, config)
        .run_at(&only(&[T1]), &only(&["S1"]), 3, now)
        .await
        .unwrap();

    assert!(matches!(
        report.find(T1, "S1").unwrap().outcome,
        PairOutcome::Failed { records: 2, .. }
    ));
    let sent = sink.inner.messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload.row_count(), 2);
    assert_eq!(
        store.get(T1, "S1").await.unwrap().last_timestamp,
        now - Duration::minutes(40)
    );
}

/// With room for every row, one payload carries the whole batch
#[tokio::test]
async fn test_table_batch_size_override() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let source = Arc::new(MemoryDataSource::from_records(
        (1..=5).map(|i| (T1, "S1", reading(now - Duration::minutes(i)))),
    ));
    let sink = Arc::new(MemorySink::new());
    let store = store(&dir).await;
    let mut config = config();
    config.table_batch_sizes.insert(T1.to_string(), 10);

    let report = uploader(&source, sink.clone(), &store, config)
        .run_at(&only(&[T1]), &only(&["S1"]), 3, now)
        .await
        .unwrap();

    assert_eq!(
        report.find(T1, "S1").unwrap().outcome,
        PairOutcome::Forwarded {
            records: 5,
            payloads: 1,
            checkpoint: now - Duration::minutes(1),
        }
    );
    assert_eq!(sink.messages().await[0].payload.row_count(), 5);
}

/// Tables outside the permitted set abort the run before any work
#[tokio::test]
async fn test_unpermitted_table_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemoryDataSource::new());
    let sink = Arc::new(MemorySink::new());
    let store = store(&dir).await;

    let err = uploader(&source, sink.clone(), &store, config())
        .run(&only(&["SECRET"]), &Selection::All, 3)
        .await
        .unwrap_err();

    assert!(matches!(err, IotSwarmError::Configuration(_)));
    assert_eq!(sink.attempts(), 0);
}

/// A table whose sites cannot be listed is reported, not fatal
#[tokio::test]
async fn test_site_listing_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemoryDataSource::new());
    source
        .set_failure(Some(IotSwarmError::auth("bad credentials")))
        .await;
    let sink = Arc::new(MemorySink::new());
    let store = store(&dir).await;

    let report = uploader(&source, sink, &store, config())
        .run(&Selection::All, &Selection::All, 3)
        .await
        .unwrap();

    assert!(report.pairs.is_empty());
    let tables: Vec<_> = report.table_errors.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(tables, vec!["T1", "T2"]);
    assert_eq!(report.errors().len(), 2);
}

/// Dry runs format payloads but neither send nor checkpoint
#[tokio::test]
async fn test_dry_run_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let source = Arc::new(MemoryDataSource::from_records([
        (T1, "S1", reading(now - Duration::hours(1))),
        (T1, "S1", reading(now - Duration::hours(2))),
    ]));
    let sink = Arc::new(MemorySink::new());
    let store = store(&dir).await;
    let config = LiveUploadConfig {
        dry_run: true,
        ..config()
    };

    let report = uploader(&source, sink.clone(), &store, config)
        .run_at(&only(&[T1]), &Selection::All, 3, now)
        .await
        .unwrap();

    assert_eq!(
        report.find(T1, "S1").unwrap().outcome,
        PairOutcome::DryRun {
            records: 2,
            payloads: 2
        }
    );
    assert_eq!(sink.attempts(), 0);
    assert!(store.snapshot().await.is_empty());
}

/// A checkpoint that cannot be persisted fails the pair after the publish
#[tokio::test]
async fn test_state_write_failure_fails_pair() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let paths = StatePaths {
        primary: dir.path().join("live.ckpt"),
        backup: dir.path().join("blocked"),
    };
    std::fs::create_dir(&paths.backup).unwrap();
    std::fs::write(paths.backup.join("keep"), b"x").unwrap();
    let store = Arc::new(CheckpointStore::open_paths(paths).await.unwrap());

    let source = Arc::new(MemoryDataSource::from_records([(
        T1,
        "S1",
        reading(now - Duration::hours(1)),
    )]));
    let sink = Arc::new(MemorySink::new());

    let report = uploader(&source, sink.clone(), &store, config())
        .run_at(&only(&[T1]), &only(&["S1"]), 3, now)
        .await
        .unwrap();

    match &report.find(T1, "S1").unwrap().outcome {
        PairOutcome::Failed { error, records } => {
            assert!(matches!(error, IotSwarmError::StateWrite(_)));
            assert_eq!(*records, 0);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(sink.published_count().await, 1);
    assert!(store.get(T1, "S1").await.is_none());
}

/// A stopped uploader starts no pair and sends nothing
#[tokio::test]
async fn test_cancelled_uploader_forwards_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let source = Arc::new(MemoryDataSource::from_records([
        (T1, "S1", reading(now - Duration::hours(1))),
        (T1, "S2", reading(now - Duration::hours(1))),
        (T1, "S3", reading(now - Duration::hours(1))),
    ]));
    let sink = Arc::new(MemorySink::new());
    let store = store(&dir).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = uploader(&source, sink.clone(), &store, config())
        .with_cancellation(cancel)
        .run_at(&only(&[T1]), &only(&["S1", "S2", "S3"]), 3, now)
        .await
        .unwrap();

    assert_eq!(report.pairs.len(), 3);
    assert_eq!(report.failed(), 3);
    assert_eq!(report.forwarded_records(), 0);
    assert!(report.errors().iter().all(|(_, e)| e.is_cancelled()));
    assert_eq!(sink.published_count().await, 0);
    assert_eq!(sink.attempts(), 0);
    assert!(store.snapshot().await.is_empty());
}

/// Cancels the shared token once the first payload is delivered
struct CancelAfterFirst {
    cancel: CancellationToken,
    inner: MemorySink,
}

#[async_trait]
impl Sink for CancelAfterFirst {
    fn name(&self) -> &str {
        "cancel-after-first"
    }

    async fn publish(&self, topic: &str, payload: &Payload) -> IotSwarmResult<()> {
        self.inner.publish(topic, payload).await?;
        self.cancel.cancel();
        Ok(())
    }
}

/// Cancellation mid pair keeps the confirmed chunk checkpointed and sends no more
#[tokio::test]
async fn test_cancel_mid_pair_stops_after_confirmed_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let source = Arc::new(MemoryDataSource::from_records([
        (T1, "S1", reading(now - Duration::minutes(30))),
        (T1, "S1", reading(now - Duration::minutes(20))),
        (T1, "S1", reading(now - Duration::minutes(10))),
        (T1, "S2", reading(now - Duration::minutes(10))),
    ]));
    let cancel = CancellationToken::new();
    let sink = Arc::new(CancelAfterFirst {
        cancel: cancel.clone(),
        inner: MemorySink::new(),
    });
    let store = store(&dir).await;

    let report = uploader(&source, sink.clone(), &store, config())
        .with_cancellation(cancel)
        .run_at(&only(&[T1]), &only(&["S1", "S2"]), 3, now)
        .await
        .unwrap();

    match &report.find(T1, "S1").unwrap().outcome {
        PairOutcome::Failed { error, records } => {
            assert!(error.is_cancelled());
            assert_eq!(*records, 1);
        }
        other => panic!("expected a cancelled pair, got {other:?}"),
    }
    assert!(matches!(
        &report.find(T1, "S2").unwrap().outcome,
        PairOutcome::Failed { error, records: 0 } if error.is_cancelled()
    ));

    assert_eq!(sink.inner.published_count().await, 1);
    assert_eq!(
        store.get(T1, "S1").await.unwrap().last_timestamp,
        now - Duration::minutes(30)
    );
    assert!(store.get(T1, "S2").await.is_none());
}
