//! Error taxonomy shared by every component (spec §7).
//!
//! Each variant carries enough structured context to be logged and to cross
//! the RPC boundary as an envelope (never a stack trace). [`SyncError`] is
//! the one error type every fallible core operation returns; component
//! modules narrow it with `?` rather than defining their own error enums.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type SyncResult<T> = Result<T, SyncError>;

/// The full error taxonomy from spec §7, grouped by the comment headers the
/// spec itself uses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    // -- caller errors: surfaced immediately, never retried --
    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("not found: {0}")]
    NotFound(String),

    // -- operational: surfaced per-run, may retry on next schedule --
    #[error("disk not connected: {disk_id}")]
    DiskNotConnected { disk_id: String },

    #[error("insufficient space: need {needed} bytes, have {available} bytes at {path}")]
    InsufficientSpace { path: PathBuf, needed: u64, available: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // -- data-integrity: per-file fatal, run continues --
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch { path: String, expected: String, actual: String },

    #[error("verification failed for {0}")]
    VerificationFailed(String),

    // -- transient --
    #[error("lock busy on {path}")]
    LockBusy { path: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,

    // -- infrastructure: run fails, daemon continues --
    #[error("store error: {0}")]
    StoreError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// True for errors §7 marks transient and worth one retry within a run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::LockBusy { .. }
                | SyncError::Timeout(_)
                | SyncError::DiskNotConnected { .. }
        )
    }

    /// True for errors that must abort the whole run rather than just the
    /// current action (spec §4.5 step 5: "Fatal errors: ENOSPC (abort run)").
    pub fn aborts_run(&self) -> bool {
        matches!(self, SyncError::InsufficientSpace { .. })
    }

    /// Map an `io::Error` encountered while touching the local or external
    /// filesystem to the closest taxonomy member. VFS further maps this down
    /// to a POSIX errno; everything else in the crate consumes `SyncError`
    /// directly.
    pub fn from_io(err: &std::io::Error, context: impl Into<String>) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => SyncError::NotFound(context.into()),
            PermissionDenied => SyncError::PermissionDenied(context.into()),
            AlreadyExists => SyncError::Internal(format!("{}: already exists", context.into())),
            _ => SyncError::Internal(format!("{}: {err}", context.into())),
        }
    }
}

/// POSIX errno-shaped view used exclusively by the VFS dispatcher (spec §4.4,
/// §7 "VFS never raises to applications: every error is mapped to the
/// closest POSIX errno").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Errno {
    ENOENT,
    EACCES,
    ENOSPC,
    EBUSY,
    EIO,
    EEXIST,
    ENOTDIR,
    EISDIR,
    EROFS,
    EINVAL,
    ENAMETOOLONG,
}

impl From<&SyncError> for Errno {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::NotFound(_) => Errno::ENOENT,
            SyncError::PermissionDenied(_) => Errno::EACCES,
            SyncError::InsufficientSpace { .. } => Errno::ENOSPC,
            SyncError::LockBusy { .. } | SyncError::Timeout(_) => Errno::EBUSY,
            SyncError::InvalidPath { .. } => Errno::EINVAL,
            SyncError::InvalidConfig(_) => Errno::EINVAL,
            _ => Errno::EIO,
        }
    }
}
