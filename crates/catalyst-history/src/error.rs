//! Error types for catalyst-history.

use thiserror::Error;

/// Result type for history operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in history operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] catalyst_storage::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
