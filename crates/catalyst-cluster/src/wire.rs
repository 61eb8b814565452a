//! JSON bodies exchanged between cluster peers.

use catalyst_history::{EntityType, Timestamp};
use serde::{Deserialize, Serialize};

/// `GET /status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub name: String,
    pub current_time: Timestamp,
}

/// `GET /challenge`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub challenge_text: String,
}

/// A content file referenced by an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFileRef {
    pub file: String,
    pub hash: String,
}

/// An entity as returned by `GET /entities/{type}?id=`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Absent from the entity file itself, whose hash is the id.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default)]
    pub pointers: Vec<String>,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub content: Vec<ContentFileRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Entity {
    /// Hashes of every file a deployment of this entity needs: the entity
    /// file itself (its hash is the entity id) followed by its content.
    pub fn file_hashes(&self) -> Vec<String> {
        let mut hashes = vec![self.id.clone()];
        for content in &self.content {
            if !hashes.contains(&content.hash) {
                hashes.push(content.hash.clone());
            }
        }
        hashes
    }
}

/// Audit information of a deployment, `GET /audit/{type}/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub auth_chain: serde_json::Value,
    /// Deployment time on the server that originated it.
    pub local_timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwritten_by: Option<String>,
}

/// Content hash used across the cluster: lowercase hex BLAKE3.
pub fn hash_content(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
