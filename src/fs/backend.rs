use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fs::types::KeyedListing;
use crate::sync::error::TransferError;

/// Keys per batched delete call; the S3 multi-object delete limit.
pub const DEFAULT_DELETE_BATCH: usize = 1000;

/// Metadata sent along with (or received from) an object.
pub type Headers = BTreeMap<String, String>;

/// Backend type information for display and identification
#[derive(Debug, Clone, PartialEq)]
pub enum BackendType {
    Local,
    S3 { bucket: String },
    Memory,
}

impl BackendType {
    /// Get a short display name for the backend
    pub fn short_name(&self) -> &'static str {
        match self {
            BackendType::Local => "Local",
            BackendType::S3 { .. } => "S3",
            BackendType::Memory => "Memory",
        }
    }
}

/// What a completed upload or download reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReceipt {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferReceipt {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    /// Bytes per second, never dividing by zero.
    pub fn speed(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            self.bytes as f64
        }
    }
}

/// Result of `get`: the receipt plus the object's stored metadata.
#[derive(Debug, Clone)]
pub struct Download {
    pub receipt: TransferReceipt,
    pub metadata: Headers,
}

/// Per-key result of a batched delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub key: String,
    pub error: Option<String>,
}

impl DeleteOutcome {
    pub fn deleted(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            error: None,
        }
    }

    pub fn failed(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.error.is_none()
    }
}

/// Storage collaborator consumed by the sync executor.
///
/// Every backend is rooted (a local directory, or a bucket plus prefix) and
/// all keys passed in or returned are relative to that root, using `/` as
/// separator. Wire-level retry is the backend's own business; an error
/// returned here is final for the item.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========== Listing ==========

    /// Enumerate the objects under the root. An absent root is an empty listing.
    async fn list_objects(&self, recursive: bool) -> Result<KeyedListing, TransferError>;

    // ========== Transfer ==========

    /// Store the local file at `key`.
    async fn put(
        &self,
        local: &Path,
        key: &str,
        headers: &Headers,
    ) -> Result<TransferReceipt, TransferError>;

    /// Write the object at `key` into `sink`, starting at `resume_offset`.
    async fn get(
        &self,
        key: &str,
        sink: &Path,
        resume_offset: u64,
    ) -> Result<Download, TransferError>;

    /// Same-store copy from one key to another.
    async fn copy(&self, from: &str, to: &str, headers: &Headers) -> Result<(), TransferError>;

    /// Delete up to [`StorageBackend::delete_batch_limit`] keys in one call.
    async fn delete_batch(&self, keys: &[String]) -> Result<Vec<DeleteOutcome>, TransferError>;

    // ========== Backend Info ==========

    /// Largest batch `delete_batch` accepts.
    fn delete_batch_limit(&self) -> usize {
        DEFAULT_DELETE_BATCH
    }

    /// Filesystem path for `key`, when the backend is a local directory.
    fn local_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }

    /// Full display form of `key` (absolute path or URI).
    fn display_path(&self, key: &str) -> String;

    /// Get the backend type
    fn backend_type(&self) -> BackendType;

    /// Check if backend is local filesystem
    fn is_local(&self) -> bool {
        matches!(self.backend_type(), BackendType::Local)
    }
}
