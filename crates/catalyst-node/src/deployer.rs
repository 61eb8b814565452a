//! Storage-backed deployer for replicated entities.
//!
//! Entities are stored as-is: no validation rules beyond the entity file
//! hashing to its id and every referenced content file being available.

use async_trait::async_trait;
use catalyst_cluster::{hash_content, AuditInfo, DeployError, Deployer, Entity, EntityFiles};
use catalyst_history::{entity_key, EntityType, Timestamp};
use catalyst_storage::Storage;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONTENTS: &str = "contents";
const ENTITIES: &str = "entities";
const AUDIT: &str = "audit";

/// Deployer writing entities, audit info and content files into [`Storage`].
#[derive(Clone)]
pub struct LocalDeployer {
    storage: Arc<dyn Storage>,
}

impl LocalDeployer {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Raw bytes of a content file (entity files included).
    pub fn content(&self, hash: &str) -> catalyst_storage::Result<Option<Vec<u8>>> {
        self.storage.get(CONTENTS, hash)
    }

    pub fn entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> catalyst_history::Result<Option<Entity>> {
        match self.storage.get(ENTITIES, &entity_key(entity_type, entity_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn audit_info(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> catalyst_history::Result<Option<AuditInfo>> {
        match self.storage.get(AUDIT, &entity_key(entity_type, entity_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn parse_entity(files: &EntityFiles, entity_id: &str) -> Result<Entity, DeployError> {
        let file = files
            .get(entity_id)
            .ok_or_else(|| DeployError::Rejected(format!("entity file {} missing", entity_id)))?;
        if hash_content(file) != entity_id {
            return Err(DeployError::Rejected(format!(
                "entity file does not hash to {}",
                entity_id
            )));
        }

        let mut entity: Entity = serde_json::from_slice(file)
            .map_err(|e| DeployError::Rejected(format!("unreadable entity file: {}", e)))?;
        entity.id = entity_id.to_string();
        Ok(entity)
    }

    fn put(&self, category: &str, key: &str, value: &[u8]) -> Result<(), DeployError> {
        self.storage
            .put(category, key, value)
            .map_err(|e| DeployError::Storage(e.to_string()))
    }
}

#[async_trait]
impl Deployer for LocalDeployer {
    async fn apply(
        &self,
        files: EntityFiles,
        entity_id: &str,
        audit_info: &AuditInfo,
    ) -> Result<Timestamp, DeployError> {
        let entity = Self::parse_entity(&files, entity_id)?;

        for content in &entity.content {
            if !files.contains_key(&content.hash) && !self.has_content(&content.hash).await {
                return Err(DeployError::Rejected(format!(
                    "content {} ({}) not available",
                    content.file, content.hash
                )));
            }
        }

        for (hash, data) in &files {
            self.put(CONTENTS, hash, data)?;
        }
        let key = entity_key(entity.entity_type, entity_id);
        let entity_json =
            serde_json::to_vec(&entity).map_err(|e| DeployError::Storage(e.to_string()))?;
        let audit_json =
            serde_json::to_vec(audit_info).map_err(|e| DeployError::Storage(e.to_string()))?;
        self.put(AUDIT, &key, &audit_json)?;
        // Written last: its presence marks the deployment as complete.
        self.put(ENTITIES, &key, &entity_json)?;

        debug!(files = files.len(), "stored deployment files");
        info!(entity = %key, origin_time = audit_info.local_timestamp, "deployed entity");
        Ok(audit_info.local_timestamp)
    }

    async fn has_content(&self, hash: &str) -> bool {
        match self.storage.exists(CONTENTS, hash) {
            Ok(found) => found,
            Err(e) => {
                warn!(%hash, "content lookup failed, assuming absent: {}", e);
                false
            }
        }
    }

    async fn is_deployed(&self, entity_type: EntityType, entity_id: &str) -> bool {
        let key = entity_key(entity_type, entity_id);
        match self.storage.exists(ENTITIES, &key) {
            Ok(found) => found,
            Err(e) => {
                warn!(entity = %key, "deployment lookup failed, assuming absent: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalyst_storage::MemoryStorage;

    fn audit(timestamp: Timestamp) -> AuditInfo {
        AuditInfo {
            version: Some("v3".into()),
            auth_chain: serde_json::Value::Null,
            local_timestamp: timestamp,
            overwritten_by: None,
        }
    }

    /// Entity files for a scene with one content file; returns the entity id.
    fn scene_files(content: &[u8]) -> (String, EntityFiles) {
        let content_hash = hash_content(content);
        let entity_file = serde_json::to_vec(&serde_json::json!({
            "type": "scene",
            "pointers": ["0,0"],
            "timestamp": 42,
            "content": [{"file": "scene.json", "hash": content_hash}],
        }))
        .unwrap();
        let id = hash_content(&entity_file);

        let mut files = EntityFiles::new();
        files.insert(id.clone(), entity_file);
        files.insert(content_hash, content.to_vec());
        (id, files)
    }

    #[tokio::test]
    async fn apply_stores_everything() {
        let deployer = LocalDeployer::new(Arc::new(MemoryStorage::new()));
        let (id, files) = scene_files(b"{}");

        let timestamp = deployer.apply(files, &id, &audit(77)).await.unwrap();

        assert_eq!(timestamp, 77);
        assert!(deployer.is_deployed(EntityType::Scene, &id).await);
        assert!(deployer.has_content(&hash_content(b"{}")).await);
        let entity = deployer.entity(EntityType::Scene, &id).unwrap().unwrap();
        assert_eq!(entity.id, id);
        assert_eq!(entity.pointers, vec!["0,0"]);
        assert_eq!(
            deployer.audit_info(EntityType::Scene, &id).unwrap().unwrap().local_timestamp,
            77
        );
        assert!(!deployer.is_deployed(EntityType::Profile, &id).await);
    }

    #[tokio::test]
    async fn already_held_content_need_not_be_sent() {
        let deployer = LocalDeployer::new(Arc::new(MemoryStorage::new()));
        let (_, files) = scene_files(b"shared");
        let (id, mut files_again) = scene_files(b"shared");
        deployer.apply(files, &id, &audit(1)).await.unwrap();

        files_again.remove(&hash_content(b"shared"));
        assert!(deployer.apply(files_again, &id, &audit(1)).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_incomplete_or_tampered_files() {
        let deployer = LocalDeployer::new(Arc::new(MemoryStorage::new()));

        let (id, mut files) = scene_files(b"missing");
        files.remove(&hash_content(b"missing"));
        assert!(matches!(
            deployer.apply(files, &id, &audit(1)).await,
            Err(DeployError::Rejected(_))
        ));

        let (id, mut files) = scene_files(b"tampered");
        files.insert(id.clone(), b"not the entity".to_vec());
        assert!(matches!(
            deployer.apply(files, &id, &audit(1)).await,
            Err(DeployError::Rejected(_))
        ));

        assert!(!deployer.is_deployed(EntityType::Scene, &id).await);
    }

    /// Storage whose every operation fails.
    struct BrokenStorage;

    impl Storage for BrokenStorage {
        fn get(&self, _: &str, _: &str) -> catalyst_storage::Result<Option<Vec<u8>>> {
            Err(catalyst_storage::Error::Backend("disk gone".into()))
        }

        fn put(&self, _: &str, _: &str, _: &[u8]) -> catalyst_storage::Result<()> {
            Err(catalyst_storage::Error::Backend("disk gone".into()))
        }

        fn delete(&self, _: &str, _: &str) -> catalyst_storage::Result<()> {
            Err(catalyst_storage::Error::Backend("disk gone".into()))
        }

        fn list(&self, _: &str) -> catalyst_storage::Result<Vec<(String, Vec<u8>)>> {
            Err(catalyst_storage::Error::Backend("disk gone".into()))
        }
    }

    #[tokio::test]
    async fn storage_failures_read_as_absent() {
        let deployer = LocalDeployer::new(Arc::new(BrokenStorage));
        let (id, files) = scene_files(b"{}");

        assert!(!deployer.has_content(&hash_content(b"{}")).await);
        assert!(!deployer.is_deployed(EntityType::Scene, &id).await);
        assert!(matches!(
            deployer.apply(files, &id, &audit(1)).await,
            Err(DeployError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn keys_match_history_entity_keys() {
        let storage = Arc::new(MemoryStorage::new());
        let deployer = LocalDeployer::new(Arc::clone(&storage) as Arc<dyn Storage>);
        let (id, files) = scene_files(b"{}");
        deployer.apply(files, &id, &audit(3)).await.unwrap();

        let key = entity_key(EntityType::Scene, &id);
        assert_eq!(key, format!("scene:{}", id));
        assert!(storage.exists(ENTITIES, &key).unwrap());
    }
}
