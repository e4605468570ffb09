use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{Config, SyncOptions};
use crate::fs::backend::StorageBackend;
use crate::fs::local::LocalBackend;
use crate::fs::object_store::ObjectStoreBackend;
use crate::sync::error::SyncError;

const S3_SCHEME: &str = "s3://";

/// One side of a sync: a local path or a bucket prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    S3 { bucket: String, prefix: String },
}

impl FromStr for Endpoint {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(S3_SCHEME) {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(SyncError::Usage(format!("missing bucket name in '{}'", s)));
            }
            return Ok(Endpoint::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            });
        }
        if s.is_empty() {
            return Err(SyncError::Usage("empty path".to_string()));
        }
        Ok(Endpoint::Local(PathBuf::from(s)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local(path) => write!(f, "{}", path.display()),
            Endpoint::S3 { bucket, prefix } => write!(f, "{}{}/{}", S3_SCHEME, bucket, prefix),
        }
    }
}

impl Endpoint {
    pub fn is_remote(&self) -> bool {
        matches!(self, Endpoint::S3 { .. })
    }

    /// Whether the endpoint names a directory-like container (trailing `/`,
    /// an existing local directory, or a bucket root).
    pub fn is_container(&self) -> bool {
        match self {
            Endpoint::Local(path) => path.to_string_lossy().ends_with('/') || path.is_dir(),
            Endpoint::S3 { prefix, .. } => prefix.is_empty() || prefix.ends_with('/'),
        }
    }

    /// Last path component, used when a source directory is nested into a destination.
    pub fn basename(&self) -> Option<String> {
        match self {
            Endpoint::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
            Endpoint::S3 { prefix, .. } => prefix
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        }
    }

    /// Append a path component.
    pub fn join(&self, name: &str) -> Endpoint {
        match self {
            Endpoint::Local(path) => Endpoint::Local(path.join(name)),
            Endpoint::S3 { bucket, prefix } => {
                let mut prefix = prefix.clone();
                if !prefix.is_empty() && !prefix.ends_with('/') {
                    prefix.push('/');
                }
                prefix.push_str(name);
                prefix.push('/');
                Endpoint::S3 {
                    bucket: bucket.clone(),
                    prefix,
                }
            }
        }
    }

    /// Resolve the destination a source is synced into.
    ///
    /// A source directory named without a trailing `/` lands inside the
    /// destination under its own name; with the slash its contents land
    /// directly in the destination.
    pub fn destination_base(
        source: &Endpoint,
        destination: &Endpoint,
    ) -> Result<Endpoint, SyncError> {
        if destination.is_remote() && !destination.is_container() {
            return Err(SyncError::Usage(format!(
                "destination '{}' must end with '/'",
                destination
            )));
        }

        let names_directory = match source {
            Endpoint::Local(path) => path.is_dir() && !path.to_string_lossy().ends_with('/'),
            Endpoint::S3 { prefix, .. } => !prefix.is_empty() && !prefix.ends_with('/'),
        };
        match (names_directory, source.basename()) {
            (true, Some(name)) => Ok(destination.join(&name)),
            _ => Ok(destination.clone()),
        }
    }

    /// Build the storage backend for this endpoint.
    pub fn open(
        &self,
        config: &Config,
        options: &SyncOptions,
    ) -> Result<Arc<dyn StorageBackend>, SyncError> {
        match self {
            Endpoint::Local(path) => Ok(Arc::new(
                LocalBackend::new(path.clone())
                    .with_digests(options.check_md5)
                    .with_follow_symlinks(options.follow_symlinks)
                    .with_attrs(options.preserve),
            )),
            Endpoint::S3 { bucket, prefix } => {
                let backend = ObjectStoreBackend::s3(bucket, prefix, &config.s3)
                    .map_err(|e| SyncError::Config(e.to_string()))?;
                Ok(Arc::new(backend))
            }
        }
    }

    /// Split a remote URI naming one object into its parent prefix and key.
    ///
    /// Containers and local paths are returned unchanged.
    pub fn object_parent(&self) -> (Endpoint, Option<String>) {
        match self {
            Endpoint::S3 { bucket, prefix } if !self.is_container() => {
                let (parent, name) = match prefix.rsplit_once('/') {
                    Some((parent, name)) => (format!("{}/", parent), name),
                    None => (String::new(), prefix.as_str()),
                };
                (
                    Endpoint::S3 {
                        bucket: bucket.clone(),
                        prefix: parent,
                    },
                    Some(name.to_string()),
                )
            }
            _ => (self.clone(), None),
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Endpoint::Local(path) => Some(path),
            Endpoint::S3 { .. } => None,
        }
    }
}
