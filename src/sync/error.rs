//! Error types for reconciliation and transfers.
//!
//! `TransferError` is what a storage collaborator hands back for a single
//! item; `SyncError` is what ends a whole run (or a whole worker).

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::sync::stats::ExitStatus;

/// Failure of a single storage operation.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Transient transport failure that survived the collaborator's own retries.
    #[error("transfer of '{key}' failed too many times (last reason: {reason})")]
    Retryable { key: String, reason: String },

    /// The remote store rejected the request.
    #[error("remote error on '{key}': {code}{}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Remote {
        key: String,
        code: String,
        status: Option<u16>,
    },

    /// The object or file does not exist.
    #[error("'{key}' not found")]
    NotFound { key: String },

    /// Local filesystem failure.
    #[error("{operation} '{}' failed: {source}", .path.display())]
    Local {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// The source cannot be transferred at all (not a regular file, unreadable name, ...).
    #[error("'{}' cannot be transferred: {reason}", .path.display())]
    InvalidFile { path: PathBuf, reason: String },
}

impl TransferError {
    /// Wrap an I/O error with the path and operation it happened on.
    pub fn local(path: impl Into<PathBuf>, operation: &'static str, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            return Self::NotFound {
                key: path.display().to_string(),
            };
        }
        Self::Local {
            path,
            operation,
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
            || matches!(self, Self::Remote { code, .. } if code == "NoSuchKey")
    }

    /// Local failures where continuing would only repeat the same error
    /// (disk full, quota exceeded, or an OS error we cannot classify).
    pub fn is_run_fatal(&self) -> bool {
        let Self::Local { source, .. } = self else {
            return false;
        };
        match source.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => true,
            io::ErrorKind::PermissionDenied
            | io::ErrorKind::IsADirectory
            | io::ErrorKind::ExecutableFileBusy
            | io::ErrorKind::ResourceBusy
            | io::ErrorKind::FileTooLarge
            | io::ErrorKind::InvalidFilename
            | io::ErrorKind::AlreadyExists
            | io::ErrorKind::NotADirectory
            | io::ErrorKind::DirectoryNotEmpty
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted => false,
            _ => source.raw_os_error().is_some(),
        }
    }

    /// Human-readable reason used in per-item audit output.
    pub fn reason(&self) -> String {
        match self {
            Self::Local { path, source, .. } => match source.kind() {
                io::ErrorKind::IsADirectory => format!("{} is a directory", path.display()),
                io::ErrorKind::ExecutableFileBusy => format!(
                    "{} is currently open for execute, cannot be overwritten",
                    path.display()
                ),
                io::ErrorKind::PermissionDenied => format!("{} permission denied", path.display()),
                io::ErrorKind::ResourceBusy => format!("{} is busy", path.display()),
                io::ErrorKind::FileTooLarge => format!("{} is too big", path.display()),
                io::ErrorKind::InvalidFilename => {
                    format!("{} File Name is too long", path.display())
                }
                io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
                    "No space left".to_string()
                }
                _ => source.to_string(),
            },
            other => other.to_string(),
        }
    }
}

/// Failure that ends a run (or one destination worker) as a whole.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad arguments or conflicting options; raised before any I/O.
    #[error("{0}")]
    Usage(String),

    /// The plan wanted more deletions than the configured ceiling allows.
    #[error("maximum requested number of deletes would be exceeded ({planned} > {ceiling}), none performed")]
    DeleteCeilingExceeded { planned: usize, ceiling: usize },

    /// Listing one side of the sync failed.
    #[error("cannot list {endpoint}: {source}")]
    Listing {
        endpoint: String,
        #[source]
        source: TransferError,
    },

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A worker stopped early; `status` is the exit status it asks for.
    #[error("{reason}")]
    Aborted { status: ExitStatus, reason: String },
}

impl SyncError {
    /// Exit status this error reduces to.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Usage(_) => ExitStatus::Usage,
            Self::DeleteCeilingExceeded { .. } => ExitStatus::Precondition,
            Self::Listing { .. } => ExitStatus::TempFail,
            Self::Config(_) => ExitStatus::Config,
            Self::Aborted { status, .. } => *status,
        }
    }
}
