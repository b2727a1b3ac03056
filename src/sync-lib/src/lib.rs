mod config;
mod device;
mod file_record;
mod file_set;
mod fs;
mod ignore;
mod vector;

pub use config::*;
pub use device::*;
pub use file_record::*;
pub use file_set::*;
pub use fs::*;
pub use ignore::*;
pub use vector::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("fsync failed: {0}")]
    SyncFailed(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("directory not empty: {0}")]
    DirNotEmpty(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("reconcile error: {0}")]
    Reconcile(String),
}

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    /// Prefixes the message with `context`, keeping the variant.
    pub fn context(self, context: &str) -> Self {
        let wrap = |msg: String| format!("{}: {}", context, msg);
        match self {
            SyncError::Internal(m) => SyncError::Internal(wrap(m)),
            SyncError::IoError(m) => SyncError::IoError(wrap(m)),
            SyncError::SyncFailed(m) => SyncError::SyncFailed(wrap(m)),
            SyncError::DbError(m) => SyncError::DbError(wrap(m)),
            SyncError::NotFound(m) => SyncError::NotFound(wrap(m)),
            SyncError::DirNotEmpty(m) => SyncError::DirNotEmpty(wrap(m)),
            SyncError::InvalidState(m) => SyncError::InvalidState(wrap(m)),
            SyncError::InvalidData(m) => SyncError::InvalidData(wrap(m)),
            SyncError::Reconcile(m) => SyncError::Reconcile(wrap(m)),
        }
    }

    /// Wraps an io error with the name of the operation that produced it.
    /// `NotFound` keeps its own variant so callers can treat "already gone"
    /// as success.
    pub fn io(context: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            SyncError::NotFound(format!("{}: {}", context, err))
        } else {
            SyncError::IoError(format!("{}: {}", context, err))
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            SyncError::NotFound(err.to_string())
        } else {
            SyncError::IoError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::InvalidData(err.to_string())
    }
}
