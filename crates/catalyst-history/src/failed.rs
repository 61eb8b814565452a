//! Registry of deployments that could not be replayed.
//!
//! One record per `(entity type, entity id)`. A later failure replaces the
//! earlier one; a successful deployment of the same entity, from any source,
//! removes it.

use catalyst_storage::Storage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{entity_key, now_millis, DeploymentEvent, EntityType, Timestamp};

const FAILED_CATEGORY: &str = "failed_deployments";

/// Why a deployment could not be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// The peer had no entity or audit info for the event.
    NoEntityOrAudit,
    /// Downloading the entity or its content failed.
    FetchProblem,
    /// The deployer rejected the entity.
    DeploymentError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoEntityOrAudit => write!(f, "NO_ENTITY_OR_AUDIT"),
            FailureReason::FetchProblem => write!(f, "FETCH_PROBLEM"),
            FailureReason::DeploymentError => write!(f, "DEPLOYMENT_ERROR"),
        }
    }
}

/// Status of an entity in the failed registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Failed(FailureReason),
    NotMarkedAsFailed,
}

/// A failed deployment together with the reason and when it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDeploymentRecord {
    pub deployment: DeploymentEvent,
    pub reason: FailureReason,
    pub recorded_at: Timestamp,
}

/// Failed deployment registry backed by [`Storage`].
#[derive(Clone)]
pub struct FailedDeployments {
    storage: Arc<dyn Storage>,
}

impl FailedDeployments {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Record a failure, replacing any earlier record for the same entity.
    pub fn report_failure(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        timestamp: Timestamp,
        server_name: &str,
        reason: FailureReason,
    ) -> Result<()> {
        self.report_failure_at(
            DeploymentEvent::new(server_name, entity_type, entity_id, timestamp),
            reason,
            now_millis(),
        )
    }

    /// Record a failure with an explicit recording time.
    pub fn report_failure_at(
        &self,
        deployment: DeploymentEvent,
        reason: FailureReason,
        recorded_at: Timestamp,
    ) -> Result<()> {
        let key = deployment.entity_key();
        warn!(
            entity = %key,
            server = %deployment.server_name,
            %reason,
            "deployment failed"
        );

        let record = FailedDeploymentRecord {
            deployment,
            reason,
            recorded_at,
        };
        let value = serde_json::to_vec(&record)?;
        self.storage.put(FAILED_CATEGORY, &key, &value)?;
        Ok(())
    }

    /// Clear the record for an entity that has now been deployed.
    pub fn report_success(&self, entity_type: EntityType, entity_id: &str) -> Result<()> {
        let key = entity_key(entity_type, entity_id);
        if self.storage.exists(FAILED_CATEGORY, &key)? {
            self.storage.delete(FAILED_CATEGORY, &key)?;
            debug!(entity = %key, "cleared failed deployment");
        }
        Ok(())
    }

    /// Failure status of an entity.
    pub fn status_of(&self, entity_type: EntityType, entity_id: &str) -> Result<DeploymentStatus> {
        Ok(match self.get(entity_type, entity_id)? {
            Some(record) => DeploymentStatus::Failed(record.reason),
            None => DeploymentStatus::NotMarkedAsFailed,
        })
    }

    /// Full record for an entity, if it is marked as failed.
    pub fn get(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<FailedDeploymentRecord>> {
        let key = entity_key(entity_type, entity_id);
        match self.storage.get(FAILED_CATEGORY, &key)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// All failed deployments, most recently reported first.
    pub fn all(&self) -> Result<Vec<FailedDeploymentRecord>> {
        let mut records = self
            .storage
            .list(FAILED_CATEGORY)?
            .into_iter()
            .map(|(_, data)| serde_json::from_slice::<FailedDeploymentRecord>(&data))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(records)
    }
}
