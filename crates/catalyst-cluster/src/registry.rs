//! Membership registry access.
//!
//! The registry is an indexed list of servers. Additions append; removing
//! entry `k` moves the last entry into slot `k` (swap-with-last).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Opaque registry key of a server entry. Never reused across edits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistryKey(pub String);

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw data stored for a registry key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Blockchain address of the owning party.
    pub owner: String,
    /// Domain as registered, not yet normalized.
    pub domain: String,
}

/// Read access to the server registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Number of entries in the registry.
    async fn count(&self) -> Result<usize>;

    /// Key stored at `index`.
    async fn key_at(&self, index: usize) -> Result<RegistryKey>;

    /// Entry data for `key`. Comparatively expensive.
    async fn record_at(&self, key: &RegistryKey) -> Result<RegistryEntry>;
}

/// In-process registry with the same append / swap-remove semantics.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    inner: RwLock<StaticInner>,
}

#[derive(Debug, Default)]
struct StaticInner {
    entries: Vec<(RegistryKey, RegistryEntry)>,
    next_key: u64,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of domains, all owned by `owner`.
    pub fn with_domains<I, S>(owner: &str, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for domain in domains {
            registry.add(owner, domain);
        }
        registry
    }

    /// Append an entry, returning its fresh key.
    pub fn add(&self, owner: &str, domain: impl Into<String>) -> RegistryKey {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.next_key += 1;
        let key = RegistryKey(format!("0x{:064x}", inner.next_key));
        inner.entries.push((
            key.clone(),
            RegistryEntry {
                owner: owner.to_string(),
                domain: domain.into(),
            },
        ));
        key
    }

    /// Remove an entry by moving the last entry into its slot.
    pub fn remove(&self, key: &RegistryKey) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.entries.iter().position(|(k, _)| k == key) {
            Some(index) => {
                inner.entries.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn count(&self) -> Result<usize> {
        Ok(self.len())
    }

    async fn key_at(&self, index: usize) -> Result<RegistryKey> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .get(index)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| Error::Registry(format!("index {} out of range", index)))
    }

    async fn record_at(&self, key: &RegistryKey) -> Result<RegistryEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, entry)| entry.clone())
            .ok_or_else(|| Error::Registry(format!("unknown key {}", key)))
    }
}
