//! Error types shared by the registry, the transfer pipeline and the manager

use crate::db::DownloadStatus;
use thiserror::Error;

/// Failure of a single download, as recorded on the entity.
///
/// Only `Network` is recoverable through resume; every other variant ends the
/// entity in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    #[error("disk error: {0}")]
    Disk(String),

    #[error("merge error: {0}")]
    Merge(String),
}

impl DownloadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Disk(err.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Errors raised by the download registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download {0} not found")]
    NotFound(String),

    #[error("illegal status transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: DownloadStatus,
        to: DownloadStatus,
    },

    #[error("invalid progress for {id}: {downloaded} (recorded {recorded}, total {total})")]
    InvalidProgress {
        id: String,
        downloaded: u64,
        recorded: u64,
        total: u64,
    },
}

/// Errors returned to callers of manager commands
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("download {0} not found")]
    NotFound(String),

    #[error("cannot {operation} download {id} while it is {status}")]
    InvalidState {
        id: String,
        status: DownloadStatus,
        operation: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to probe {url}: {source}")]
    Probe {
        url: String,
        #[source]
        source: DownloadError,
    },
}

pub type ManagerResult<T> = std::result::Result<T, ManagerError>;
