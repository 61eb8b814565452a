//! Error types for the Catalyst node.

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An environment variable held a value the node cannot use.
#[derive(Debug, Error)]
#[error("invalid {var}={value:?}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Errors that can occur while starting or running a node.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] catalyst_storage::Error),

    /// History error
    #[error("History error: {0}")]
    History(#[from] catalyst_history::Error),

    /// Cluster error
    #[error("Cluster error: {0}")]
    Cluster(#[from] catalyst_cluster::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
