//! Initializer error types.

use thiserror::Error;

use flowgate_store::StoreError;

/// Errors that abort initialization. None of them is retried.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("store unreachable: {0}")]
    StoreUnreachable(String),

    #[error("schema at version {current} but {latest} is required and upgrades are disabled")]
    SchemaOutdated { current: i64, latest: i64 },

    #[error("migration {version} failed: {reason}")]
    Migration { version: i64, reason: String },

    #[error("invalid admin credentials: {0}")]
    InvalidCredentials(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl InitError {
    /// Process exit code reported by the `version` role.
    pub fn exit_code(&self) -> i32 {
        match self {
            InitError::StoreUnreachable(_) => 2,
            _ => 3,
        }
    }

    /// Sort a store error into unreachable vs. failed.
    pub(crate) fn from_store(e: StoreError) -> Self {
        if e.is_connectivity() {
            InitError::StoreUnreachable(e.to_string())
        } else {
            match e {
                StoreError::Migration { version, reason } => InitError::Migration { version, reason },
                other => InitError::Store(other),
            }
        }
    }
}

pub type InitResult<T> = Result<T, InitError>;
