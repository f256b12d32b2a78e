//! Error types for the tonindex pipeline.

use thiserror::Error;

use crate::types::ShardIdent;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Record source error: {0}")]
    Source(#[from] SourceError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Commit failed for shard {shard} at seqno {seqno}: {source}")]
    Write {
        shard: ShardIdent,
        seqno: u32,
        #[source]
        source: WriteError,
    },

    #[error("Shard {shard} halted at seqno {seqno}: {reason}")]
    ShardHalted {
        shard: ShardIdent,
        seqno: u32,
        reason: String,
    },

    #[error("Ordering violation in shard {shard}: last committed {last}, got {got}")]
    OrderingViolation { shard: ShardIdent, last: u32, got: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error stops forward progress for a shard and
    /// requires operator intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Write { .. }
                | Self::ShardHalted { .. }
                | Self::OrderingViolation { .. }
                | Self::Config(_)
        )
    }
}

/// Errors returned by a [`RecordSource`](crate::source::RecordSource).
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Timeout, connection loss, or data not yet available. Retried with backoff.
    #[error("transient source error: {0}")]
    Transient(String),

    /// The source cannot serve this cursor at all.
    #[error("source failure: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors returned by a [`BatchWriter`](crate::writer::BatchWriter).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    /// Timeout or connection loss. The commit did not happen and may be retried.
    #[error("retryable store error: {0}")]
    Retryable(String),

    /// A constraint implied by ordering was violated (e.g. missing parent row).
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Any other non-retryable store failure.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl WriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Errors found while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<ConfigError> for IndexerError {
    fn from(err: ConfigError) -> Self {
        IndexerError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_classification() {
        assert!(WriteError::Retryable("timeout".into()).is_retryable());
        assert!(!WriteError::Constraint("fk".into()).is_retryable());
        assert!(!WriteError::Fatal("disk".into()).is_retryable());
    }

    #[test]
    fn fatal_indexer_errors() {
        let halted = IndexerError::ShardHalted {
            shard: ShardIdent::MASTERCHAIN,
            seqno: 7,
            reason: "retries exhausted".into(),
        };
        assert!(halted.is_fatal());
        assert!(!IndexerError::Source(SourceError::Transient("x".into())).is_fatal());
        assert!(halted.to_string().contains("seqno 7"));
    }
}
