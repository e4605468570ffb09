// Tests for the sync engine: planning, safety gate and destination fan-out

use std::sync::Arc;

use bucketsync::config::SyncOptions;
use bucketsync::fs::{LocalBackend, StorageBackend};
use bucketsync::sync::{ExitStatus, SyncEngine, SyncError};

use super::support::{audit_channel, drain, keys, local_tree, seed, Failure, RecordingBackend};

fn mirror() -> SyncOptions {
    SyncOptions {
        delete_removed: true,
        ..SyncOptions::default()
    }
}

#[tokio::test]
async fn test_end_to_end_sync() {
    let tree = local_tree(&[("a", b"0123456789"), ("b", b"01234567890123456789")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory());
    seed(dest.as_ref(), &[("b", b"01234567890123456789"), ("c", b"01234")]).await;

    let report = SyncEngine::new(source, dest.clone(), mirror())
        .unwrap()
        .sync()
        .await
        .unwrap();

    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(report.stats.files_transferred, 1);
    assert_eq!(report.stats.size_transferred, 10);
    assert_eq!(report.stats.files_deleted, 1);
    assert_eq!(report.stats.files_unchanged, 1);
    assert_eq!(report.stats.files, 2);
    assert_eq!(keys(dest.as_ref()).await, vec!["a", "b"]);
}

#[tokio::test]
async fn test_second_run_transfers_nothing() {
    let tree = local_tree(&[("x/1.txt", b"one"), ("x/2.txt", b"two"), ("3.txt", b"three")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory());

    let engine = SyncEngine::new(source, dest.clone(), mirror()).unwrap();
    let first = engine.sync().await.unwrap();
    assert_eq!(first.stats.files_transferred, 3);

    let puts = dest.puts();
    let second = engine.sync().await.unwrap();
    assert_eq!(second.stats.files_transferred, 0);
    assert_eq!(second.stats.files_unchanged, 3);
    assert_eq!(dest.puts(), puts);
}

#[tokio::test]
async fn test_fan_out_to_several_destinations() {
    let tree = local_tree(&[("a", b"aaa"), ("b", b"bbbb")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let first = Arc::new(RecordingBackend::memory());
    let second = Arc::new(RecordingBackend::memory());
    seed(second.as_ref(), &[("a", b"aaa")]).await;

    let (tx, rx) = audit_channel();
    let engine = SyncEngine::new(source, first.clone(), SyncOptions::default())
        .unwrap()
        .add_destination(second.clone())
        .with_audit(tx);
    let report = engine.sync().await.unwrap();
    drop(engine);

    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(report.workers.len(), 2);
    assert_eq!(report.workers[0].stats.files_transferred, 2);
    assert_eq!(report.workers[1].stats.files_transferred, 1);
    assert_eq!(report.stats.files_transferred, 3);
    assert_eq!(keys(first.as_ref()).await, vec!["a", "b"]);
    assert_eq!(keys(second.as_ref()).await, vec!["a", "b"]);
    assert_eq!(drain(rx).len(), 3);
}

#[tokio::test]
async fn test_worst_status_wins_across_destinations() {
    let tree = local_tree(&[("a", b"aaa")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let healthy = Arc::new(RecordingBackend::memory());
    let broken = Arc::new(RecordingBackend::memory().failing("a", Failure::Retryable));

    let report = SyncEngine::new(source, healthy.clone(), SyncOptions::default())
        .unwrap()
        .add_destination(broken)
        .sync()
        .await
        .unwrap();

    assert_eq!(report.workers[0].status, ExitStatus::Ok);
    assert_eq!(report.workers[1].status, ExitStatus::Partial);
    assert_eq!(report.status, ExitStatus::Partial);
    assert_eq!(keys(healthy.as_ref()).await, vec!["a"]);
}

#[tokio::test]
async fn test_delete_ceiling_aborts_before_any_mutation() {
    let tree = local_tree(&[("keep", b"k")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let first = Arc::new(RecordingBackend::memory());
    let second = Arc::new(RecordingBackend::memory());
    seed(
        second.as_ref(),
        &[("o1", b"1"), ("o2", b"2"), ("o3", b"3"), ("o4", b"4"), ("o5", b"5"), ("o6", b"6")],
    )
    .await;
    let seeded_calls = second.calls();

    let options = SyncOptions {
        max_delete: 5,
        ..mirror()
    };
    let err = SyncEngine::new(source, first.clone(), options)
        .unwrap()
        .add_destination(second.clone())
        .sync()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SyncError::DeleteCeilingExceeded {
            planned: 6,
            ceiling: 5
        }
    ));
    assert_eq!(err.exit_status(), ExitStatus::Precondition);
    assert_eq!(first.puts(), 0);
    assert_eq!(second.calls(), seeded_calls + 1);
    assert_eq!(keys(second.as_ref()).await.len(), 6);
}

#[tokio::test]
async fn test_empty_source_does_not_wipe_destination() {
    let tree = local_tree(&[]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory());
    seed(dest.as_ref(), &[("precious", b"data")]).await;

    let report = SyncEngine::new(source.clone(), dest.clone(), mirror())
        .unwrap()
        .sync()
        .await
        .unwrap();
    assert_eq!(report.stats.files_deleted, 0);
    assert_eq!(keys(dest.as_ref()).await, vec!["precious"]);

    let forced = SyncOptions {
        force: true,
        ..mirror()
    };
    let report = SyncEngine::new(source, dest.clone(), forced)
        .unwrap()
        .sync()
        .await
        .unwrap();
    assert_eq!(report.stats.files_deleted, 1);
    assert!(keys(dest.as_ref()).await.is_empty());
}

#[tokio::test]
async fn test_excluded_keys_are_neither_sent_nor_deleted() {
    let tree = local_tree(&[("main.rs", b"fn main() {}"), ("debug.log", b"noise")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory());
    seed(dest.as_ref(), &[("old.log", b"kept")]).await;

    let options = SyncOptions {
        exclude: vec!["*.log".to_string()],
        ..mirror()
    };
    let report = SyncEngine::new(source, dest.clone(), options)
        .unwrap()
        .sync()
        .await
        .unwrap();

    assert_eq!(report.stats.files_transferred, 1);
    assert_eq!(report.stats.files_excluded, 1);
    assert_eq!(report.stats.files_deleted, 0);
    assert_eq!(keys(dest.as_ref()).await, vec!["main.rs", "old.log"]);
}

#[tokio::test]
async fn test_identical_content_is_copied_not_uploaded() {
    let tree = local_tree(&[("a/report.pdf", b"same bytes"), ("b/report.pdf", b"same bytes")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory());

    let engine = SyncEngine::new(source, dest.clone(), SyncOptions::default()).unwrap();
    engine.sync().await.unwrap();
    assert_eq!(keys(dest.as_ref()).await, vec!["a/report.pdf", "b/report.pdf"]);
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let tree = local_tree(&[("new", b"n")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory());
    seed(dest.as_ref(), &[("stale", b"s"), ("scratch.tmp", b"t")]).await;

    let options = SyncOptions {
        dry_run: true,
        exclude: vec!["*.tmp".to_string()],
        ..mirror()
    };
    let (tx, rx) = audit_channel();
    let engine = SyncEngine::new(source, dest.clone(), options)
        .unwrap()
        .with_audit(tx);
    let report = engine.sync().await.unwrap();
    drop(engine);

    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(keys(dest.as_ref()).await, vec!["scratch.tmp", "stale"]);
    let lines = drain(rx);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "exclude: scratch.tmp");
    assert!(lines[1].starts_with("upload: "));
    assert_eq!(lines[2], "delete: 'memory://stale'");
}

#[tokio::test]
async fn test_invalid_rate_is_a_usage_error() {
    let tree = local_tree(&[]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory());
    let options = SyncOptions {
        limit_rate: Some(0),
        ..SyncOptions::default()
    };
    let err = SyncEngine::new(source, dest, options).err().unwrap();
    assert_eq!(err.exit_status(), ExitStatus::Usage);
}
