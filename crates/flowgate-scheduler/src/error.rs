//! Scheduler error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the scheduler loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("refusing to schedule: {0}")]
    SchemaNotReady(String),

    #[error("unsupported schedule: {0}")]
    UnsupportedSchedule(String),

    #[error("invalid workflow definition {path}: {reason}")]
    InvalidDefinition { path: PathBuf, reason: String },

    #[error("cannot read workflows folder {path}: {reason}")]
    Folder { path: PathBuf, reason: String },

    #[error("store error: {0}")]
    Store(#[from] flowgate_store::StoreError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
