//! Deployment types shared by the ledger, the failed registry and the cluster.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// Kinds of entity a deployment can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Scene,
    Profile,
    Wearable,
    Emote,
    Store,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Scene,
        EntityType::Profile,
        EntityType::Wearable,
        EntityType::Emote,
        EntityType::Store,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Scene => "scene",
            EntityType::Profile => "profile",
            EntityType::Wearable => "wearable",
            EntityType::Emote => "emote",
            EntityType::Store => "store",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidInput(format!("unknown entity type: {}", s)))
    }
}

/// A single entity publication: who deployed what, and when.
///
/// Events are immutable once created. The same `entity_id` may appear more
/// than once in an append-only log; consumers deduplicate by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEvent {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub timestamp: Timestamp,
    pub server_name: String,
}

impl DeploymentEvent {
    pub fn new(
        server_name: impl Into<String>,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            timestamp,
            server_name: server_name.into(),
        }
    }

    /// Chronological order: timestamp first, entity id as tie-break.
    pub fn chronological_cmp(&self, other: &DeploymentEvent) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.entity_id.cmp(&other.entity_id))
    }

    /// Check if this event happened strictly after another.
    pub fn is_newer_than(&self, other: &DeploymentEvent) -> bool {
        self.chronological_cmp(other) == Ordering::Greater
    }

    /// Registry key for per-entity bookkeeping (`{type}:{id}`).
    pub fn entity_key(&self) -> String {
        entity_key(self.entity_type, &self.entity_id)
    }
}

/// Storage key shared by every per-entity record (`{type}:{id}`).
pub fn entity_key(entity_type: EntityType, entity_id: &str) -> String {
    format!("{}:{}", entity_type, entity_id)
}
