use thiserror::Error;
use tonindex_core::{IndexerError, WriteError};

/// Errors raised inside a storage backend before they are mapped onto the
/// commit taxonomy.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A referential or uniqueness check failed. Retrying cannot help.
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// The backend is busy, locked or unreachable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Backend(String),
}

impl From<StoreError> for WriteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Constraint(msg) => WriteError::Constraint(msg),
            StoreError::Unavailable(msg) => WriteError::Retryable(msg),
            other => WriteError::Fatal(other.to_string()),
        }
    }
}

impl From<StoreError> for IndexerError {
    fn from(err: StoreError) -> Self {
        IndexerError::Storage(err.to_string())
    }
}
