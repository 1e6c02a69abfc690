// Error types for lock handling, scheduling and cache refresh

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Lock file errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Lock file not found: {0}")]
    NotFound(PathBuf),
}

impl LockError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LockError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Schedule calculation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("No next occurrence of {target} after {reference}")]
    NoNextOccurrence { target: String, reference: String },
}

/// Scheduling engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("Scheduling engine has been shut down")]
    ShutDown,

    #[error("A job named '{0}' is already registered")]
    DuplicateJob(String),

    #[error("No tokio runtime available to arm triggers")]
    NoRuntime,

    #[error("Cache scheduler already started")]
    AlreadyStarted,

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),
}

/// Errors reported by a cache candidate while refreshing from the store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheUpdateError {
    /// Data access failed for this candidate only; the pass continues
    #[error("Data access failed: {0}")]
    DataAccess(String),

    /// Unexpected failure; aborts the whole pass
    #[error("Unexpected cache update failure: {0}")]
    Unexpected(String),
}

impl CacheUpdateError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CacheUpdateError::DataAccess(_))
    }
}

/// Backing store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned from a job firing
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Lock handling failed: {0}")]
    Lock(#[from] LockError),

    #[error("Scheduling failed: {0}")]
    Scheduling(#[from] SchedulingError),

    #[error("Fatal job failure: {0}")]
    Fatal(String),
}
