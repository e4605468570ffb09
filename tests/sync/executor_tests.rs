// Tests for the transfer executor

use std::sync::Arc;
use std::time::Duration;

use bucketsync::config::SyncOptions;
use bucketsync::fs::{Entry, LocalBackend, ObjectStoreBackend, StorageBackend};
use bucketsync::sync::{BandwidthLimiter, CopyPair, Executor, ExitStatus, Plan, DRY_RUN_NOTICE};

use super::support::{audit_channel, drain, keys, local_tree, seed, Failure, RecordingBackend};

fn entry(key: &str, size: u64) -> Entry {
    Entry::new(key, size)
}

#[tokio::test]
async fn test_dry_run_makes_no_calls() {
    let source = Arc::new(RecordingBackend::memory());
    let dest = Arc::new(RecordingBackend::memory());
    let plan = Plan {
        to_create: vec![entry("new.txt", 3)],
        to_update: vec![entry("changed.txt", 4)],
        to_delete: vec![entry("old.txt", 5)],
        copy_pairs: vec![CopyPair {
            source: entry("dup.txt", 6),
            existing_key: "orig.txt".to_string(),
            target_key: "dup.txt".to_string(),
        }],
        unchanged: vec!["same.txt".to_string()],
        excluded: vec!["skip.log".to_string()],
        delete_after: true,
    };

    let options = SyncOptions {
        dry_run: true,
        ..SyncOptions::default()
    };
    let (tx, rx) = audit_channel();
    let executor = Executor::new(source.clone(), dest.clone(), &options).with_audit(tx);
    let report = executor.execute(plan).await;
    drop(executor);

    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(source.calls(), 0);
    assert_eq!(dest.calls(), 0);
    assert_eq!(report.stats.files_unchanged, 1);
    assert_eq!(report.stats.files_transferred, 0);

    let lines = drain(rx);
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], "exclude: skip.log");
    assert!(lines[1].starts_with("copy: 'memory://new.txt'"));
    assert!(lines[2].contains("changed.txt"));
    assert!(lines[3].starts_with("remote copy: "));
    assert!(lines[4].starts_with("delete: "));
    assert_eq!(lines[5], DRY_RUN_NOTICE);
}

#[tokio::test]
async fn test_uploads_and_deletes() {
    let tree = local_tree(&[("a", b"0123456789"), ("b", b"01234567890123456789")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory());
    seed(dest.as_ref(), &[("b", b"01234567890123456789"), ("c", b"01234")]).await;

    let plan = Plan {
        to_create: vec![entry("a", 10)],
        to_delete: vec![entry("c", 5)],
        unchanged: vec!["b".to_string()],
        ..Plan::default()
    };
    let (tx, rx) = audit_channel();
    let executor = Executor::new(source, dest.clone(), &SyncOptions::default()).with_audit(tx);
    let report = executor.execute(plan).await;
    drop(executor);

    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(report.stats.files_transferred, 1);
    assert_eq!(report.stats.size_transferred, 10);
    assert_eq!(report.stats.files_deleted, 1);
    assert_eq!(report.stats.files_unchanged, 1);
    assert_eq!(keys(dest.as_ref()).await, vec!["a", "b"]);

    let lines = drain(rx);
    // Deletes run first unless delete-after was requested.
    assert_eq!(lines[0], "delete: 'memory://c'");
    assert!(lines[1].starts_with("upload: '"));
    assert!(lines[1].contains("-> 'memory://a' (10 bytes in"));
    assert!(lines[1].ends_with("[1 of 1]"));
}

#[tokio::test]
async fn test_failed_copy_falls_back_to_transfer() {
    let tree = local_tree(&[("new", b"fresh"), ("dup", b"same!")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory().failing_copies());
    seed(dest.as_ref(), &[("orig", b"same!")]).await;

    let plan = Plan {
        to_create: vec![entry("new", 5)],
        copy_pairs: vec![CopyPair {
            source: entry("dup", 5),
            existing_key: "orig".to_string(),
            target_key: "dup".to_string(),
        }],
        delete_after: true,
        ..Plan::default()
    };
    let (tx, rx) = audit_channel();
    let executor = Executor::new(source, dest.clone(), &SyncOptions::default()).with_audit(tx);
    let report = executor.execute(plan).await;
    drop(executor);

    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(dest.copies(), 1);
    assert_eq!(report.stats.files_copied, 0);
    assert_eq!(report.stats.files_transferred, 2);
    assert_eq!(keys(dest.as_ref()).await, vec!["dup", "new", "orig"]);

    let lines = drain(rx);
    assert!(lines[0].ends_with("[1 of 1]"));
    assert!(lines[1].contains("'memory://dup'"));
    assert!(lines[1].ends_with("[2 of 2]"));
}

#[tokio::test]
async fn test_copy_pairs_run_before_deletes() {
    let source = Arc::new(RecordingBackend::memory());
    let dest = Arc::new(RecordingBackend::memory());
    seed(dest.as_ref(), &[("orig", b"content")]).await;

    let plan = Plan {
        copy_pairs: vec![CopyPair {
            source: entry("moved", 7),
            existing_key: "orig".to_string(),
            target_key: "moved".to_string(),
        }],
        to_delete: vec![entry("orig", 7)],
        delete_after: true,
        ..Plan::default()
    };
    let executor = Executor::new(source, dest.clone(), &SyncOptions::default());
    let report = executor.execute(plan).await;

    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(report.stats.size_copied, 7);
    let log = dest.log();
    let tail: Vec<&str> = log.iter().rev().take(2).rev().map(String::as_str).collect();
    assert_eq!(tail, vec!["copy:orig->moved", "delete:orig"]);
    assert_eq!(keys(dest.as_ref()).await, vec!["moved"]);
}

#[tokio::test]
async fn test_failures_continue_without_stop_on_error() {
    let tree = local_tree(&[("a", b"aa"), ("b", b"bb")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory().failing("a", Failure::Retryable));

    let plan = Plan {
        to_create: vec![entry("a", 2), entry("b", 2)],
        ..Plan::default()
    };
    let report = Executor::new(source, dest.clone(), &SyncOptions::default())
        .execute(plan)
        .await;

    assert_eq!(report.status, ExitStatus::Partial);
    assert_eq!(report.stats.files_failed, 1);
    assert_eq!(report.stats.files_transferred, 1);
    assert_eq!(dest.puts(), 2);
    assert!(report.aborted.is_none());
}

#[tokio::test]
async fn test_stop_on_error_aborts_worker() {
    let tree = local_tree(&[("a", b"aa"), ("b", b"bb")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory().failing("a", Failure::Remote));

    let plan = Plan {
        to_create: vec![entry("a", 2), entry("b", 2)],
        to_delete: vec![entry("z", 1)],
        delete_after: true,
        ..Plan::default()
    };
    let options = SyncOptions {
        stop_on_error: true,
        ..SyncOptions::default()
    };
    let report = Executor::new(source, dest.clone(), &options).execute(plan).await;

    assert_eq!(report.status, ExitStatus::DataErr);
    assert!(report.aborted.is_some());
    assert_eq!(dest.puts(), 1);
    assert_eq!(dest.delete_calls(), 0);
}

#[tokio::test]
async fn test_no_space_is_fatal_for_the_worker() {
    let tree = local_tree(&[("a", b"aa"), ("b", b"bb")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory().failing("a", Failure::NoSpace));

    let plan = Plan {
        to_create: vec![entry("a", 2), entry("b", 2)],
        ..Plan::default()
    };
    let report = Executor::new(source, dest.clone(), &SyncOptions::default())
        .execute(plan)
        .await;

    assert_eq!(report.status, ExitStatus::OsFile);
    assert_eq!(dest.puts(), 1);
}

#[tokio::test]
async fn test_vanished_source_only_warns() {
    let source = Arc::new(RecordingBackend::memory().failing("gone", Failure::NotFound));
    let dest = Arc::new(RecordingBackend::memory());

    let plan = Plan {
        to_create: vec![entry("gone", 4)],
        ..Plan::default()
    };
    let report = Executor::new(source, dest, &SyncOptions::default())
        .execute(plan)
        .await;

    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(report.stats.files_failed, 0);
    assert_eq!(report.stats.files_transferred, 0);
}

#[tokio::test]
async fn test_download_leaves_no_staging_files() {
    let source = Arc::new(ObjectStoreBackend::memory("").unwrap());
    seed(source.as_ref(), &[("dir/file.txt", b"payload"), ("top.txt", b"x")]).await;
    let target = tempfile::TempDir::new().unwrap();
    let dest: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(target.path()));

    let plan = Plan {
        to_create: vec![entry("dir/file.txt", 7), entry("top.txt", 1)],
        ..Plan::default()
    };
    let (tx, rx) = audit_channel();
    let executor = Executor::new(source, dest, &SyncOptions::default()).with_audit(tx);
    let report = executor.execute(plan).await;
    drop(executor);

    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(
        std::fs::read(target.path().join("dir/file.txt")).unwrap(),
        b"payload"
    );
    let names: Vec<String> = std::fs::read_dir(target.path().join("dir"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["file.txt"]);
    assert!(drain(rx)[0].starts_with("download: 'memory://dir/file.txt'"));
}

#[tokio::test]
async fn test_failed_download_removes_staging_file() {
    let source = Arc::new(RecordingBackend::memory().failing("a.txt", Failure::Retryable));
    let target = tempfile::TempDir::new().unwrap();
    let dest: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(target.path()));

    let plan = Plan {
        to_create: vec![entry("a.txt", 3)],
        ..Plan::default()
    };
    let report = Executor::new(source, dest, &SyncOptions::default())
        .execute(plan)
        .await;

    assert_eq!(report.status, ExitStatus::Partial);
    assert_eq!(std::fs::read_dir(target.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_deletes_are_batched() {
    let source = Arc::new(RecordingBackend::memory());
    let dest = Arc::new(RecordingBackend::memory().with_batch_limit(2));
    seed(
        dest.as_ref(),
        &[("k1", b"1"), ("k2", b"2"), ("k3", b"3"), ("k4", b"4"), ("k5", b"5")],
    )
    .await;

    let plan = Plan {
        to_delete: (1..=5).map(|i| entry(&format!("k{i}"), 1)).collect(),
        ..Plan::default()
    };
    let report = Executor::new(source, dest.clone(), &SyncOptions::default())
        .execute(plan)
        .await;

    assert_eq!(report.stats.files_deleted, 5);
    assert_eq!(report.stats.size_deleted, 5);
    assert_eq!(dest.delete_calls(), 3);
    assert!(keys(dest.as_ref()).await.is_empty());
}

#[tokio::test]
async fn test_remote_to_remote_relays_content() {
    let source = Arc::new(ObjectStoreBackend::memory("").unwrap());
    seed(source.as_ref(), &[("blob", b"relayed bytes")]).await;
    let dest = Arc::new(ObjectStoreBackend::memory("").unwrap());

    let plan = Plan {
        to_create: vec![entry("blob", 13)],
        ..Plan::default()
    };
    let report = Executor::new(source, dest.clone(), &SyncOptions::default())
        .execute(plan)
        .await;

    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(report.stats.size_transferred, 13);
    let listing = dest.list_objects(true).await.unwrap();
    assert_eq!(listing.get("blob").map(|e| e.size), Some(13));
}

#[tokio::test]
async fn test_rate_limit_waits_before_sending() {
    let tree = local_tree(&[("a", b"0123456789")]);
    let source: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(tree.path()));
    let dest = Arc::new(RecordingBackend::memory());

    // One KiB per second, with the only token already spent.
    let limiter = BandwidthLimiter::new(Some(1024));
    limiter.acquire(1).await;

    let plan = Plan {
        to_create: vec![entry("a", 10)],
        ..Plan::default()
    };
    let executor =
        Executor::new(source, dest.clone(), &SyncOptions::default()).with_limiter(limiter);
    let worker = tokio::spawn(async move { executor.execute(plan).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dest.puts(), 0);

    let report = worker.await.unwrap();
    assert_eq!(report.status, ExitStatus::Ok);
    assert_eq!(report.stats.files_transferred, 1);
    assert_eq!(dest.puts(), 1);
}
