//! In-memory storage.

use crate::error::{Error, Result};
use crate::Storage;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Volatile storage backend. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    categories: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Backend("memory storage lock poisoned".into())
}

impl Storage for MemoryStorage {
    fn get(&self, category: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let categories = self.categories.read().map_err(poisoned)?;
        Ok(categories
            .get(category)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn put(&self, category: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut categories = self.categories.write().map_err(poisoned)?;
        categories
            .entry(category.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, category: &str, key: &str) -> Result<()> {
        let mut categories = self.categories.write().map_err(poisoned)?;
        if let Some(entries) = categories.get_mut(category) {
            entries.remove(key);
        }
        Ok(())
    }

    fn list(&self, category: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let categories = self.categories.read().map_err(poisoned)?;
        Ok(categories
            .get(category)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
