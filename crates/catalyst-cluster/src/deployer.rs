//! The local deployment pipeline a replicated event is handed to.

use async_trait::async_trait;
use catalyst_history::{EntityType, Timestamp};
use std::collections::HashMap;
use thiserror::Error;

use crate::wire::AuditInfo;

/// Files of one deployment, keyed by content hash. Includes the entity file.
pub type EntityFiles = HashMap<String, Vec<u8>>;

/// Why the deployer refused a deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The entity failed validation.
    #[error("deployment rejected: {0}")]
    Rejected(String),

    /// The deployment could not be persisted.
    #[error("deployment storage error: {0}")]
    Storage(String),
}

/// Applies replicated deployments locally.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Apply a deployment. Returns its timestamp on the originating server.
    async fn apply(
        &self,
        files: EntityFiles,
        entity_id: &str,
        audit_info: &AuditInfo,
    ) -> Result<Timestamp, DeployError>;

    /// Whether a content file is already held locally and need not be fetched.
    async fn has_content(&self, _hash: &str) -> bool {
        false
    }

    /// Whether the entity has already been deployed locally.
    async fn is_deployed(&self, _entity_type: EntityType, _entity_id: &str) -> bool {
        false
    }
}
