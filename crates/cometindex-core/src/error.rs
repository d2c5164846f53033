//! Error types for the cometindex pipeline.

use thiserror::Error;

/// Errors that can occur while indexing or backfilling.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Handler error in '{indexer}': {reason}")]
    Handler { indexer: String, reason: String },

    /// A block was queued behind a higher one that was already processed.
    #[error("Block {height} is queued after block {previous}")]
    OutOfOrder { height: u64, previous: u64 },

    #[error("Invalid block range: {0}")]
    InvalidRange(String),

    #[error("Requested start height {start} out of range [{earliest}, {latest}]")]
    InvalidStartHeight { start: u64, earliest: u64, latest: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` for transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Storage(_))
    }

    /// Returns `true` if the pipeline must stop rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OutOfOrder { .. } | Self::InvalidStartHeight { .. } | Self::Config(_)
        )
    }

    /// Wrap any displayable failure raised by user indexer code.
    pub fn handler(indexer: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Handler {
            indexer: indexer.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_message() {
        let err = IndexerError::OutOfOrder { height: 4, previous: 5 };
        assert_eq!(err.to_string(), "Block 4 is queued after block 5");
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(IndexerError::Rpc("timeout".into()).is_retryable());
        assert!(IndexerError::Storage("conn reset".into()).is_retryable());
        assert!(!IndexerError::Config("bad url".into()).is_retryable());
    }
}
