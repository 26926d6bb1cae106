use std::time::Duration;

use thiserror::Error;

/// Local cache failures. Callers treat every variant as "cache unavailable",
/// never as an authoritative empty result.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache unavailable")]
    Unavailable,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Closed set of outcomes a transport can fail with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request cancelled")]
    Cancelled,
    #[error("network error: {0}")]
    Network(String),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the same request may succeed if tried again later.
    ///
    /// Only an explicit server rejection is final. A malformed response to a
    /// send may hide a stored message, and the server's idempotency on
    /// `client_id` makes a retry harmless.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. })
    }
}

/// Why a send was refused before it reached the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("message body is empty")]
    EmptyBody,
    #[error("a send is already in progress")]
    AlreadySending,
    #[error("session not ready: {0}")]
    SessionNotReady(String),
}
