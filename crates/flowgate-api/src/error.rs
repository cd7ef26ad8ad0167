//! API server error types.

use thiserror::Error;

use flowgate_store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("refusing to serve: {0}")]
    SchemaNotReady(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type ApiResult<T> = Result<T, ApiError>;
