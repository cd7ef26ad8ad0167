//! Error types for the metadata store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported store url: {0}")]
    UnsupportedUrl(String),

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("schema not migrated: {0}")]
    SchemaNotMigrated(String),

    #[error("migration {version} failed: {reason}")]
    Migration { version: i64, reason: String },

    #[error("postgres error: {0}")]
    Postgres(sqlx::Error),
}

/// PostgreSQL `undefined_table`.
const UNDEFINED_TABLE: &str = "42P01";

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        let undefined_table = e
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == UNDEFINED_TABLE);
        if undefined_table {
            StoreError::SchemaNotMigrated(e.to_string())
        } else {
            StoreError::Postgres(e)
        }
    }
}

impl StoreError {
    /// Whether the error means the store could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        match self {
            StoreError::Open(_) => true,
            StoreError::Postgres(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}
