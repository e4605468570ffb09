use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::layers::{RetryLayer, TimeoutLayer};
use opendal::services::{Memory, S3};
use opendal::{ErrorKind, Metadata, Operator};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::S3Settings;
use crate::fs::backend::{
    BackendType, DeleteOutcome, Download, Headers, StorageBackend, TransferReceipt,
};
use crate::fs::types::{Attrs, Entry, KeyedListing, ATTRS_HEADER};
use crate::sync::error::TransferError;
use crate::sync::hash::digest_from_etag;

/// Upload chunk size handed to the opendal writer.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Object storage backend (S3 and S3-compatible stores) using OpenDAL.
///
/// Keys are relative to `prefix`, which is installed as the operator root.
pub struct ObjectStoreBackend {
    operator: Operator,
    scheme: BackendType,
    prefix: String,
}

impl ObjectStoreBackend {
    /// Create a backend for `s3://bucket/prefix`.
    ///
    /// Credentials fall back to the standard AWS chain when the settings carry none.
    pub fn s3(bucket: &str, prefix: &str, settings: &S3Settings) -> Result<Self, TransferError> {
        let mut builder = S3::default()
            .bucket(bucket)
            .region(&settings.region)
            .root(&root_for(prefix));

        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&settings.access_key, &settings.secret_key) {
            builder = builder
                .access_key_id(access_key)
                .secret_access_key(secret_key);
        }

        let operator = Operator::new(builder)
            .map_err(|e| map_error(bucket, e))?
            .layer(
                TimeoutLayer::default().with_timeout(Duration::from_secs(settings.timeout_secs)),
            )
            .layer(RetryLayer::new().with_max_times(settings.retries))
            .finish();

        Ok(Self::from_operator(
            operator,
            BackendType::S3 {
                bucket: bucket.to_string(),
            },
            prefix,
        ))
    }

    /// In-process object store, used for tests and dry experiments.
    pub fn memory(prefix: &str) -> Result<Self, TransferError> {
        let builder = Memory::default().root(&root_for(prefix));
        let operator = Operator::new(builder)
            .map_err(|e| map_error(prefix, e))?
            .finish();
        Ok(Self::from_operator(operator, BackendType::Memory, prefix))
    }

    /// Wrap an already configured operator.
    pub fn from_operator(operator: Operator, scheme: BackendType, prefix: &str) -> Self {
        Self {
            operator,
            scheme,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    fn supports_user_metadata(&self) -> bool {
        self.operator.info().full_capability().write_with_user_metadata
    }

    fn supports_copy(&self) -> bool {
        self.operator.info().full_capability().copy
    }

    /// Build a listing entry, calling `stat` when the listing metadata
    /// cannot produce a digest on its own.
    async fn entry_for(&self, key: &str, listed: &Metadata) -> Result<Entry, TransferError> {
        let listed_digest = listed.etag().and_then(digest_from_etag);
        let stat = if listed_digest.is_none() {
            Some(
                self.operator
                    .stat(key)
                    .await
                    .map_err(|e| map_error(key, e))?,
            )
        } else {
            None
        };
        let meta = stat.as_ref().unwrap_or(listed);

        let mut entry =
            Entry::new(key, meta.content_length()).with_origin(self.display_path(key));

        let attrs = meta
            .user_metadata()
            .and_then(|m| m.get(ATTRS_HEADER))
            .map(|value| Attrs::parse_header_value(value));
        let digest = listed_digest
            .or_else(|| meta.etag().and_then(digest_from_etag))
            .or_else(|| attrs.as_ref().and_then(|a| a.md5.clone()));
        if let Some(digest) = digest {
            entry = entry.with_digest(digest);
        }
        if let Some(attrs) = attrs {
            entry = entry.with_attrs(attrs);
        }
        Ok(entry)
    }

    async fn read_write_copy(
        &self,
        from: &str,
        to: &str,
        headers: &Headers,
    ) -> Result<(), TransferError> {
        let data = self
            .operator
            .read(from)
            .await
            .map_err(|e| map_error(from, e))?;
        let mut write = self.operator.write_with(to, data);
        if self.supports_user_metadata() && !headers.is_empty() {
            write = write.user_metadata(headers.clone());
        }
        write.await.map_err(|e| map_error(to, e))?;
        Ok(())
    }

    async fn delete_one_by_one(&self, keys: &[String]) -> Vec<DeleteOutcome> {
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            match self.operator.delete(key).await {
                Ok(()) => outcomes.push(DeleteOutcome::deleted(key.as_str())),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    outcomes.push(DeleteOutcome::deleted(key.as_str()))
                }
                Err(e) => outcomes.push(DeleteOutcome::failed(
                    key.as_str(),
                    format!("{:?}: {}", e.kind(), e),
                )),
            }
        }
        outcomes
    }
}

fn root_for(prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", prefix)
    }
}

/// Translate an OpenDAL error into the per-item taxonomy.
fn map_error(key: &str, e: opendal::Error) -> TransferError {
    match e.kind() {
        ErrorKind::NotFound => TransferError::NotFound {
            key: key.to_string(),
        },
        _ if e.is_temporary() => TransferError::Retryable {
            key: key.to_string(),
            reason: e.to_string(),
        },
        ErrorKind::PermissionDenied => TransferError::Remote {
            key: key.to_string(),
            code: "AccessDenied".to_string(),
            status: Some(403),
        },
        ErrorKind::RangeNotSatisfied => TransferError::Remote {
            key: key.to_string(),
            code: "InvalidRange".to_string(),
            status: Some(416),
        },
        kind => TransferError::Remote {
            key: key.to_string(),
            code: format!("{:?}", kind),
            status: None,
        },
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn list_objects(&self, recursive: bool) -> Result<KeyedListing, TransferError> {
        let mut lister = self
            .operator
            .lister_with("")
            .recursive(recursive)
            .await
            .map_err(|e| map_error(&self.prefix, e))?;

        let mut listing = KeyedListing::new();
        while let Some(item) = lister
            .try_next()
            .await
            .map_err(|e| map_error(&self.prefix, e))?
        {
            let key = item.path().trim_start_matches('/');
            if key.is_empty() || key.ends_with('/') || item.metadata().is_dir() {
                continue;
            }
            match self.entry_for(key, item.metadata()).await {
                Ok(entry) => {
                    listing.insert(entry);
                }
                Err(e) if e.is_not_found() => {
                    debug!("Object {} vanished while listing", key);
                }
                Err(e) => return Err(e),
            }
        }

        debug!("Listed {} objects under {}", listing.len(), self.display_path(""));
        Ok(listing)
    }

    async fn put(
        &self,
        local: &Path,
        key: &str,
        headers: &Headers,
    ) -> Result<TransferReceipt, TransferError> {
        let started = Instant::now();
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| TransferError::local(local, "open", e))?;

        let mut writer = self.operator.writer_with(key).chunk(CHUNK_SIZE);
        if self.supports_user_metadata() && !headers.is_empty() {
            writer = writer.user_metadata(headers.clone());
        } else if !headers.is_empty() {
            debug!("{} does not store user metadata, dropping headers", self.scheme.short_name());
        }
        let mut writer = writer.await.map_err(|e| map_error(key, e))?;

        let mut bytes = 0u64;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|e| TransferError::local(local, "read", e))?;
            if read == 0 {
                break;
            }
            if let Err(e) = writer.write(buffer[..read].to_vec()).await {
                if let Err(abort) = writer.abort().await {
                    warn!("Aborting upload of {} failed: {}", key, abort);
                }
                return Err(map_error(key, e));
            }
            bytes += read as u64;
        }
        writer.close().await.map_err(|e| map_error(key, e))?;

        Ok(TransferReceipt::new(bytes, started.elapsed()))
    }

    async fn get(
        &self,
        key: &str,
        sink: &Path,
        resume_offset: u64,
    ) -> Result<Download, TransferError> {
        let started = Instant::now();
        let meta = self
            .operator
            .stat(key)
            .await
            .map_err(|e| map_error(key, e))?;

        let data = if resume_offset > 0 {
            if resume_offset >= meta.content_length() {
                Vec::new()
            } else {
                self.operator
                    .read_with(key)
                    .range(resume_offset..)
                    .await
                    .map_err(|e| map_error(key, e))?
                    .to_vec()
            }
        } else {
            self.operator
                .read(key)
                .await
                .map_err(|e| map_error(key, e))?
                .to_vec()
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resume_offset > 0)
            .truncate(resume_offset == 0)
            .open(sink)
            .await
            .map_err(|e| TransferError::local(sink, "open", e))?;
        file.write_all(&data)
            .await
            .map_err(|e| TransferError::local(sink, "write", e))?;
        file.flush()
            .await
            .map_err(|e| TransferError::local(sink, "write", e))?;

        let metadata: Headers = meta
            .user_metadata()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(Download {
            receipt: TransferReceipt::new(data.len() as u64, started.elapsed()),
            metadata,
        })
    }

    async fn copy(&self, from: &str, to: &str, headers: &Headers) -> Result<(), TransferError> {
        if !self.supports_copy() {
            return self.read_write_copy(from, to, headers).await;
        }
        self.operator
            .copy(from, to)
            .await
            .map_err(|e| map_error(from, e))
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<Vec<DeleteOutcome>, TransferError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        match self.operator.delete_iter(keys.iter().cloned()).await {
            Ok(()) => Ok(keys.iter().map(|k| DeleteOutcome::deleted(k.as_str())).collect()),
            Err(e) => {
                debug!("Batch delete failed ({}), retrying key by key", e);
                Ok(self.delete_one_by_one(keys).await)
            }
        }
    }

    fn display_path(&self, key: &str) -> String {
        let scheme = match &self.scheme {
            BackendType::S3 { bucket } => format!("s3://{}", bucket),
            BackendType::Memory => "memory://".to_string(),
            BackendType::Local => String::new(),
        };
        let mut path = scheme;
        for part in [self.prefix.as_str(), key] {
            if part.is_empty() {
                continue;
            }
            if !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(part);
        }
        if key.is_empty() && !path.ends_with('/') {
            path.push('/');
        }
        path
    }

    fn backend_type(&self) -> BackendType {
        self.scheme.clone()
    }
}
