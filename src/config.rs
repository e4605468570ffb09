//! Configuration file loading and the merged per-run option set.
//!
//! The file is optional; every field has a default. Command-line flags are
//! applied on top by the binary, producing the [`SyncOptions`] value that
//! the comparator, gate and executor are constructed from.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::sync::error::SyncError;

const CONFIG_DIR: &str = "bucketsync";
const CONFIG_FILE: &str = "config.toml";

/// Connection settings for S3 and S3-compatible stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: String,
    /// Custom endpoint for S3-compatible providers (MinIO, R2, Wasabi, ...).
    pub endpoint: Option<String>,
    /// Wire-level retry attempts before an item is reported as failed.
    pub retries: usize,
    pub timeout_secs: u64,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            access_key: None,
            secret_key: None,
            region: "us-east-1".to_string(),
            endpoint: None,
            retries: 5,
            timeout_secs: 300,
        }
    }
}

/// Options for one sync, delete or copy invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub delete_removed: bool,
    pub delete_after: bool,
    /// Upper bound on deletions per run; 0 means unlimited.
    pub max_delete: usize,
    pub dry_run: bool,
    pub force: bool,
    pub stop_on_error: bool,
    /// Compare content digests in addition to sizes.
    pub check_md5: bool,
    pub preserve: bool,
    pub follow_symlinks: bool,
    pub recursive: bool,
    /// Bandwidth ceiling in bytes per second.
    pub limit_rate: Option<u64>,
    pub stats: bool,
    pub exclude: Vec<String>,
    pub rexclude: Vec<String>,
    pub include: Vec<String>,
    pub rinclude: Vec<String>,
    pub exclude_from: Vec<PathBuf>,
    pub rexclude_from: Vec<PathBuf>,
    pub include_from: Vec<PathBuf>,
    pub rinclude_from: Vec<PathBuf>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            delete_removed: false,
            delete_after: false,
            max_delete: 0,
            dry_run: false,
            force: false,
            stop_on_error: false,
            check_md5: true,
            preserve: false,
            follow_symlinks: false,
            recursive: true,
            limit_rate: None,
            stats: false,
            exclude: Vec::new(),
            rexclude: Vec::new(),
            include: Vec::new(),
            rinclude: Vec::new(),
            exclude_from: Vec::new(),
            rexclude_from: Vec::new(),
            include_from: Vec::new(),
            rinclude_from: Vec::new(),
        }
    }
}

impl SyncOptions {
    /// Reject flag combinations that make no sense, before any I/O.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.limit_rate == Some(0) {
            return Err(SyncError::Usage(
                "--limit-rate must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub s3: S3Settings,
    pub sync: SyncOptions,
}

impl Config {
    /// Default location: `<config dir>/bucketsync/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from `path`, or from the default location when `path` is `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Config::default(),
            },
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text).map_err(|e| match e {
            SyncError::Config(msg) => SyncError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self, SyncError> {
        toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Credentials from the standard AWS variables take precedence over the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("AWS_ACCESS_KEY_ID") {
            self.s3.access_key = Some(key);
        }
        if let Some(secret) = lookup("AWS_SECRET_ACCESS_KEY") {
            self.s3.secret_key = Some(secret);
        }
        if let Some(region) = lookup("AWS_REGION").or_else(|| lookup("AWS_DEFAULT_REGION")) {
            self.s3.region = region;
        }
        if let Some(endpoint) = lookup("AWS_ENDPOINT_URL") {
            self.s3.endpoint = Some(endpoint);
        }
    }
}
