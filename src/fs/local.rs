use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jwalk::WalkDir;
use rayon::prelude::*;
use std::fs::{self, File, FileTimes};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::fs::backend::{
    BackendType, DeleteOutcome, Download, Headers, StorageBackend, TransferReceipt,
};
use crate::fs::types::{Attrs, Entry, KeyedListing, ATTRS_HEADER};
use crate::sync::error::TransferError;
use crate::sync::hash;

/// Prefix of the staging files written next to their final destination.
pub const TEMP_PREFIX: &str = ".bucketsync.";
pub const TEMP_SUFFIX: &str = ".tmp";

/// A local directory tree used as either side of a sync.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    /// Set when the endpoint names a single file rather than a directory.
    single: Option<String>,
    digests: bool,
    follow_symlinks: bool,
    capture_attrs: bool,
}

impl LocalBackend {
    /// Root the backend at `path`. A path naming a regular file lists only that file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (root, single) = match (path.is_file(), path.parent(), path.file_name()) {
            (true, Some(parent), Some(name)) => {
                (parent.to_path_buf(), Some(name.to_string_lossy().to_string()))
            }
            _ => (path, None),
        };
        Self {
            root,
            single,
            digests: true,
            follow_symlinks: false,
            capture_attrs: false,
        }
    }

    pub fn with_digests(mut self, enabled: bool) -> Self {
        self.digests = enabled;
        self
    }

    pub fn with_follow_symlinks(mut self, enabled: bool) -> Self {
        self.follow_symlinks = enabled;
        self
    }

    pub fn with_attrs(mut self, enabled: bool) -> Self {
        self.capture_attrs = enabled;
        self
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn walk(&self, recursive: bool) -> Vec<Entry> {
        if let Some(name) = &self.single {
            return self
                .entry_for(&self.root.join(name), name.clone())
                .into_iter()
                .collect();
        }
        if !self.root.is_dir() {
            return Vec::new();
        }

        let mut walker = WalkDir::new(&self.root)
            .sort(true)
            .skip_hidden(false)
            .follow_links(self.follow_symlinks);
        if !recursive {
            walker = walker.max_depth(1);
        }

        let mut entries = Vec::new();
        for dir_entry in walker {
            let dir_entry = match dir_entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", self.root.display(), e);
                    continue;
                }
            };
            if !dir_entry.file_type().is_file() {
                continue;
            }
            let path = dir_entry.path();
            let Some(key) = relative_key(&self.root, &path) else {
                warn!("Skipping file with non UTF-8 name: {}", path.display());
                continue;
            };
            if is_staging_file(&key) {
                debug!("Ignoring staging file {}", key);
                continue;
            }
            if let Some(entry) = self.entry_for(&path, key) {
                entries.push(entry);
            }
        }
        entries
    }

    fn entry_for(&self, path: &Path, key: String) -> Option<Entry> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                warn!("Cannot stat {}: {}", path.display(), e);
                return None;
            }
        };
        let mut entry = Entry::new(key, metadata.len()).with_origin(path.display().to_string());
        if let Ok(modified) = metadata.modified() {
            entry = entry.with_modified(DateTime::<Utc>::from(modified));
        }
        if self.capture_attrs {
            entry = entry.with_attrs(attrs_from_metadata(&metadata));
        }
        Some(entry)
    }
}

/// Whether a key names one of our own download staging files.
pub fn is_staging_file(key: &str) -> bool {
    let name = key.rsplit('/').next().unwrap_or(key);
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    let key = parts?.join("/");
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

#[cfg(unix)]
fn attrs_from_metadata(metadata: &fs::Metadata) -> Attrs {
    use std::os::unix::fs::MetadataExt;
    Attrs {
        mode: Some(metadata.mode()),
        uid: Some(metadata.uid()),
        gid: Some(metadata.gid()),
        atime: Some(metadata.atime()),
        mtime: Some(metadata.mtime()),
        md5: None,
    }
}

#[cfg(not(unix))]
fn attrs_from_metadata(metadata: &fs::Metadata) -> Attrs {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);
    Attrs {
        mtime,
        ..Attrs::default()
    }
}

/// Apply preserved timestamps and mode to a file that was just written.
pub fn restore_attrs(path: &Path, attrs: &Attrs) -> io::Result<()> {
    if let Some(mtime) = attrs.mtime {
        let to_system_time = |secs: i64| UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64);
        let times = FileTimes::new()
            .set_modified(to_system_time(mtime))
            .set_accessed(to_system_time(attrs.atime.unwrap_or(mtime)));
        File::options().write(true).open(path)?.set_times(times)?;
    }

    // Mode last, it may drop our own write permission.
    #[cfg(unix)]
    if let Some(mode) = attrs.mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

/// Attributes carried in a header map, if any.
pub fn attrs_from_headers(headers: &Headers) -> Option<Attrs> {
    headers
        .get(ATTRS_HEADER)
        .map(|value| Attrs::parse_header_value(value))
        .filter(|attrs| !attrs.is_empty())
}

/// Create a staging file in `dir`; it is removed on drop unless persisted.
pub fn staging_file(dir: &Path) -> io::Result<tempfile::NamedTempFile> {
    fs::create_dir_all(dir)?;
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn list_objects(&self, recursive: bool) -> Result<KeyedListing, TransferError> {
        let backend = self.clone();
        let mut entries = tokio::task::spawn_blocking(move || backend.walk(recursive))
            .await
            .map_err(|e| TransferError::InvalidFile {
                path: self.root.clone(),
                reason: format!("listing task failed: {}", e),
            })?;

        if self.digests && !entries.is_empty() {
            entries = tokio::task::spawn_blocking(move || {
                entries
                    .into_par_iter()
                    .map(|entry| match hash::hash_file(Path::new(&entry.origin)) {
                        Ok(digest) => entry.with_digest(digest),
                        Err(e) => {
                            warn!("Cannot compute digest of {}: {}", entry.origin, e);
                            entry
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .await
            .map_err(|e| TransferError::InvalidFile {
                path: self.root.clone(),
                reason: format!("digest task failed: {}", e),
            })?;
        }

        debug!("Listed {} files under {}", entries.len(), self.root.display());
        Ok(entries.into_iter().collect())
    }

    async fn put(
        &self,
        local: &Path,
        key: &str,
        headers: &Headers,
    ) -> Result<TransferReceipt, TransferError> {
        let target = self.path_for(key);
        let source = local.to_path_buf();
        let attrs = attrs_from_headers(headers);
        let started = Instant::now();

        let bytes = tokio::task::spawn_blocking(move || -> Result<u64, TransferError> {
            if !source.is_file() {
                return Err(TransferError::InvalidFile {
                    path: source,
                    reason: "not a regular file".to_string(),
                });
            }
            let parent = target.parent().unwrap_or(Path::new("."));
            let staged = staging_file(parent)
                .map_err(|e| TransferError::local(parent, "create", e))?;
            let bytes = fs::copy(&source, staged.path())
                .map_err(|e| TransferError::local(&source, "copy", e))?;
            staged
                .persist(&target)
                .map_err(|e| TransferError::local(&target, "rename", e.error))?;
            if let Some(attrs) = attrs {
                restore_attrs(&target, &attrs)
                    .map_err(|e| TransferError::local(&target, "chmod", e))?;
            }
            Ok(bytes)
        })
        .await
        .map_err(|e| TransferError::InvalidFile {
            path: local.to_path_buf(),
            reason: format!("copy task failed: {}", e),
        })??;

        Ok(TransferReceipt::new(bytes, started.elapsed()))
    }

    async fn get(
        &self,
        key: &str,
        sink: &Path,
        resume_offset: u64,
    ) -> Result<Download, TransferError> {
        let source = self.path_for(key);
        let sink = sink.to_path_buf();
        let capture_attrs = self.capture_attrs;
        let started = Instant::now();

        let (bytes, metadata) =
            tokio::task::spawn_blocking(move || -> Result<(u64, Headers), TransferError> {
                let mut input =
                    File::open(&source).map_err(|e| TransferError::local(&source, "open", e))?;
                let metadata = input
                    .metadata()
                    .map_err(|e| TransferError::local(&source, "stat", e))?;
                if resume_offset > 0 {
                    input
                        .seek(SeekFrom::Start(resume_offset))
                        .map_err(|e| TransferError::local(&source, "seek", e))?;
                }
                let mut output = File::options()
                    .create(true)
                    .write(true)
                    .append(resume_offset > 0)
                    .truncate(resume_offset == 0)
                    .open(&sink)
                    .map_err(|e| TransferError::local(&sink, "open", e))?;
                let bytes = io::copy(&mut input, &mut output)
                    .map_err(|e| TransferError::local(&sink, "write", e))?;

                let mut headers = Headers::new();
                if capture_attrs {
                    if let Some(value) = attrs_from_metadata(&metadata).to_header_value() {
                        headers.insert(ATTRS_HEADER.to_string(), value);
                    }
                }
                Ok((bytes, headers))
            })
            .await
            .map_err(|e| TransferError::InvalidFile {
                path: self.path_for(key),
                reason: format!("read task failed: {}", e),
            })??;

        Ok(Download {
            receipt: TransferReceipt::new(bytes, started.elapsed()),
            metadata,
        })
    }

    async fn copy(&self, from: &str, to: &str, headers: &Headers) -> Result<(), TransferError> {
        let source = self.path_for(from);
        self.put(&source, to, headers).await.map(|_| ())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<Vec<DeleteOutcome>, TransferError> {
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.path_for(key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => outcomes.push(DeleteOutcome::deleted(key.as_str())),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    outcomes.push(DeleteOutcome::deleted(key.as_str()))
                }
                Err(e) => outcomes.push(DeleteOutcome::failed(key.as_str(), e.to_string())),
            }
        }
        Ok(outcomes)
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        Some(self.path_for(key))
    }

    fn display_path(&self, key: &str) -> String {
        self.path_for(key).display().to_string()
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}
