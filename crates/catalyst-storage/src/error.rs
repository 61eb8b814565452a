//! Error types for catalyst-storage.

use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading or writing storage.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Backend(e.to_string())
    }
}
