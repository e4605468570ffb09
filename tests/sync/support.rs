// Recording storage backend and fixtures shared by the sync tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

use bucketsync::fs::{
    BackendType, DeleteOutcome, Download, Headers, KeyedListing, ObjectStoreBackend,
    StorageBackend, TransferReceipt,
};
use bucketsync::sync::{AuditLine, AuditSender, TransferError};

/// Failure injected for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Retryable,
    NotFound,
    NoSpace,
    Remote,
}

impl Failure {
    fn error(self, key: &str) -> TransferError {
        match self {
            Failure::Retryable => TransferError::Retryable {
                key: key.to_string(),
                reason: "connection reset".to_string(),
            },
            Failure::NotFound => TransferError::NotFound {
                key: key.to_string(),
            },
            Failure::NoSpace => TransferError::local(
                format!("/scratch/{key}"),
                "write",
                io::Error::from(io::ErrorKind::StorageFull),
            ),
            Failure::Remote => TransferError::Remote {
                key: key.to_string(),
                code: "AccessDenied".to_string(),
                status: Some(403),
            },
        }
    }
}

/// Wraps a real backend, counting calls and failing on demand.
pub struct RecordingBackend {
    inner: Arc<dyn StorageBackend>,
    calls: AtomicUsize,
    puts: AtomicUsize,
    copies: AtomicUsize,
    delete_calls: AtomicUsize,
    log: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, Failure>>,
    fail_copies: bool,
    batch_limit: Option<usize>,
}

impl RecordingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            fail_copies: false,
            batch_limit: None,
        }
    }

    /// Fresh in-memory object store, recorded.
    pub fn memory() -> Self {
        Self::new(Arc::new(ObjectStoreBackend::memory("").unwrap()))
    }

    pub fn failing(self, key: &str, failure: Failure) -> Self {
        self.failures.lock().unwrap().insert(key.to_string(), failure);
        self
    }

    pub fn failing_copies(mut self) -> Self {
        self.fail_copies = true;
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Operations in call order, e.g. `put:a`, `copy:b->a`, `delete:c`.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(entry);
    }

    fn failure_for(&self, key: &str) -> Option<TransferError> {
        self.failures.lock().unwrap().get(key).map(|f| f.error(key))
    }
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    async fn list_objects(&self, recursive: bool) -> Result<KeyedListing, TransferError> {
        self.record("list".to_string());
        self.inner.list_objects(recursive).await
    }

    async fn put(
        &self,
        local: &Path,
        key: &str,
        headers: &Headers,
    ) -> Result<TransferReceipt, TransferError> {
        self.record(format!("put:{key}"));
        self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure_for(key) {
            return Err(err);
        }
        self.inner.put(local, key, headers).await
    }

    async fn get(
        &self,
        key: &str,
        sink: &Path,
        resume_offset: u64,
    ) -> Result<Download, TransferError> {
        self.record(format!("get:{key}"));
        if let Some(err) = self.failure_for(key) {
            return Err(err);
        }
        self.inner.get(key, sink, resume_offset).await
    }

    async fn copy(&self, from: &str, to: &str, headers: &Headers) -> Result<(), TransferError> {
        self.record(format!("copy:{from}->{to}"));
        self.copies.fetch_add(1, Ordering::SeqCst);
        if self.fail_copies {
            return Err(Failure::Remote.error(to));
        }
        self.inner.copy(from, to, headers).await
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<Vec<DeleteOutcome>, TransferError> {
        self.record(format!("delete:{}", keys.join(",")));
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_batch(keys).await
    }

    fn delete_batch_limit(&self) -> usize {
        self.batch_limit
            .unwrap_or_else(|| self.inner.delete_batch_limit())
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.inner.local_path(key)
    }

    fn display_path(&self, key: &str) -> String {
        self.inner.display_path(key)
    }

    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }
}

/// Local directory populated with `files`.
pub fn local_tree(files: &[(&str, &[u8])]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (key, content) in files {
        let path = dir.path().join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    dir
}

/// Upload `files` into `backend` without going through the executor.
pub async fn seed(backend: &dyn StorageBackend, files: &[(&str, &[u8])]) {
    let scratch = TempDir::new().unwrap();
    for (index, (key, content)) in files.iter().enumerate() {
        let path = scratch.path().join(format!("seed-{index}"));
        std::fs::write(&path, content).unwrap();
        backend.put(&path, key, &Headers::new()).await.unwrap();
    }
}

/// Keys currently stored in `backend`.
pub async fn keys(backend: &dyn StorageBackend) -> Vec<String> {
    let listing = backend.list_objects(true).await.unwrap();
    listing.keys().map(str::to_string).collect()
}

/// Audit channel whose lines can be drained once the senders are gone.
pub fn audit_channel() -> (AuditSender, mpsc::Receiver<AuditLine>) {
    mpsc::channel(4096)
}

pub fn drain(mut rx: mpsc::Receiver<AuditLine>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line.text);
    }
    lines
}
