//! Error types for catalyst-cluster.

use thiserror::Error;

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving membership or talking to peers.
#[derive(Debug, Error)]
pub enum Error {
    /// The membership registry could not be read.
    #[error("registry error: {0}")]
    Registry(String),

    /// A registry domain is not usable as a peer address.
    #[error("invalid server address {address:?}: {reason}")]
    InvalidAddress {
        address: String,
        reason: &'static str,
    },

    /// Transport-level HTTP failure (connect, timeout, body decode).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer answered with a non-success status.
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    /// Downloaded bytes do not hash to the requested content hash.
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Local history or failed-deployment bookkeeping failed.
    #[error("history error: {0}")]
    History(#[from] catalyst_history::Error),
}
