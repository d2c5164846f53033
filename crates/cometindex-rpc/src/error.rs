//! Transport-level error types.

use thiserror::Error;

use cometindex_core::error::IndexerError;

use crate::request::JsonRpcError;

/// Errors raised by the RPC client and the live subscription transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, timeout, bad status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connect/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC error object returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Payload did not have the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer closed the socket with a non-normal close code.
    #[error("Connection closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    /// The peer ended the stream cleanly without being asked to.
    #[error("Connection closed by remote")]
    ClosedByRemote,

    /// A configured start height the node cannot serve.
    #[error("Requested start height {start} out of range [{earliest}, {latest}]")]
    InvalidStartHeight { start: u64, earliest: u64, latest: u64 },

    /// Block-source failure surfaced through a transport.
    #[error("Block source error: {0}")]
    Source(String),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Configuration errors are final, everything else is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidStartHeight { .. })
    }
}

impl From<TransportError> for IndexerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidStartHeight {
                start,
                earliest,
                latest,
            } => IndexerError::InvalidStartHeight {
                start,
                earliest,
                latest,
            },
            other => IndexerError::Rpc(other.to_string()),
        }
    }
}

impl From<IndexerError> for TransportError {
    fn from(err: IndexerError) -> Self {
        match err {
            IndexerError::InvalidStartHeight {
                start,
                earliest,
                latest,
            } => TransportError::InvalidStartHeight {
                start,
                earliest,
                latest,
            },
            other => TransportError::Source(other.to_string()),
        }
    }
}
