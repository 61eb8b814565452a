//! Cluster membership resolution.
//!
//! # Change detection
//!
//! The registry only appends, and removes by swapping the last entry into
//! the removed slot. Any addition or removal therefore changes either the
//! size or the key sitting at the last index:
//!
//! ```text
//! [A, B, C]  remove A  →  [C, B]      size changed
//! [A, B, C]  remove C  →  [A, B]      size changed
//! [A, B]     remove A, add D → [B, D] last key changed
//! ```
//!
//! So `(count, key_at(count - 1))` equal to the previous pair means nothing
//! changed, and the resolver stops after two calls. On a change, entries
//! already known by key are reused; only the last slot (which may have just
//! received a swapped-in entry) and unknown keys are fetched.

use reqwest::Url;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::{Registry, RegistryEntry, RegistryKey};

/// A server participating in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: RegistryKey,
    pub owner: String,
    /// Normalized `https://` URL without trailing slash.
    pub base_address: String,
}

impl ServerRecord {
    /// Build a record from raw registry data, normalizing the address.
    pub fn from_entry(id: RegistryKey, entry: RegistryEntry) -> Result<Self> {
        Ok(Self {
            id,
            owner: entry.owner,
            base_address: normalize_address(&entry.domain)?,
        })
    }
}

/// Normalize a registered domain into an `https://` base URL.
///
/// Domains without a scheme get `https://`. An explicit `http://` is rejected.
pub fn normalize_address(domain: &str) -> Result<String> {
    let invalid = |reason| Error::InvalidAddress {
        address: domain.to_string(),
        reason,
    };

    let trimmed = domain.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty domain"));
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") {
        return Err(invalid("insecure http transport"));
    }

    let candidate = if lower.starts_with("https://") {
        trimmed.to_string()
    } else if trimmed.contains("://") {
        return Err(invalid("unsupported scheme"));
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&candidate).map_err(|_| invalid("unparseable url"))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }

    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// The current cluster members plus change-detection state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    servers: HashMap<RegistryKey, ServerRecord>,
    last_count: usize,
    last_entry_key: Option<RegistryKey>,
}

impl MembershipSnapshot {
    /// Snapshot with no members, as before the first resolution.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerRecord> {
        self.servers.values()
    }

    pub fn get(&self, id: &RegistryKey) -> Option<&ServerRecord> {
        self.servers.get(id)
    }

    pub fn contains(&self, id: &RegistryKey) -> bool {
        self.servers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Registry size at the last check.
    pub fn last_count(&self) -> usize {
        self.last_count
    }

    /// Key at the final registry index at the last check.
    pub fn last_entry_key(&self) -> Option<&RegistryKey> {
        self.last_entry_key.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn from_records(records: Vec<ServerRecord>) -> Self {
        let last_entry_key = records.last().map(|r| r.id.clone());
        Self {
            last_count: records.len(),
            servers: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            last_entry_key,
        }
    }
}

/// Resolves cluster membership from a [`Registry`].
#[derive(Clone)]
pub struct MembershipResolver {
    registry: Arc<dyn Registry>,
}

impl MembershipResolver {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// Resolve the current membership, reusing `previous` where possible.
    pub async fn resolve(&self, previous: &MembershipSnapshot) -> Result<MembershipSnapshot> {
        let count = self.registry.count().await?;
        if count == 0 {
            if previous.last_count != 0 {
                info!("registry is empty");
            }
            return Ok(MembershipSnapshot::empty());
        }

        let last_key = self.registry.key_at(count - 1).await?;
        if count == previous.last_count && previous.last_entry_key.as_ref() == Some(&last_key) {
            debug!(count, "membership unchanged");
            return Ok(previous.clone());
        }

        let mut servers = HashMap::with_capacity(count);
        for index in 0..count - 1 {
            let key = self.registry.key_at(index).await?;
            if let Some(known) = previous.servers.get(&key) {
                servers.insert(key, known.clone());
                continue;
            }
            self.fetch_into(&mut servers, key).await?;
        }
        self.fetch_into(&mut servers, last_key.clone()).await?;

        info!(
            count,
            members = servers.len(),
            previous = previous.servers.len(),
            "membership changed"
        );

        Ok(MembershipSnapshot {
            servers,
            last_count: count,
            last_entry_key: Some(last_key),
        })
    }

    async fn fetch_into(
        &self,
        servers: &mut HashMap<RegistryKey, ServerRecord>,
        key: RegistryKey,
    ) -> Result<()> {
        let entry = self.registry.record_at(&key).await?;
        match ServerRecord::from_entry(key.clone(), entry) {
            Ok(record) => {
                servers.insert(key, record);
            }
            Err(e) => warn!(%key, "dropping registry entry: {}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Registry wrapper counting the expensive per-key reads.
    struct CountingRegistry {
        inner: StaticRegistry,
        record_reads: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl CountingRegistry {
        fn new(domains: &[&str]) -> Self {
            Self {
                inner: StaticRegistry::with_domains("0xowner", domains.iter().copied()),
                record_reads: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn take_reads(&self) -> usize {
            self.record_reads.swap(0, Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Registry for CountingRegistry {
        async fn count(&self) -> Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Registry("node unavailable".into()));
            }
            self.inner.count().await
        }

        async fn key_at(&self, index: usize) -> Result<RegistryKey> {
            self.inner.key_at(index).await
        }

        async fn record_at(&self, key: &RegistryKey) -> Result<RegistryEntry> {
            self.record_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.record_at(key).await
        }
    }

    fn addresses(snapshot: &MembershipSnapshot) -> Vec<String> {
        let mut addresses: Vec<_> = snapshot.servers().map(|s| s.base_address.clone()).collect();
        addresses.sort();
        addresses
    }

    #[test]
    fn normalize_adds_https_and_strips_slash() {
        assert_eq!(normalize_address("peer.example.com").unwrap(), "https://peer.example.com");
        assert_eq!(
            normalize_address("https://peer.example.com/").unwrap(),
            "https://peer.example.com"
        );
        assert_eq!(
            normalize_address("  peer.example.com/content/ ").unwrap(),
            "https://peer.example.com/content"
        );
    }

    #[test]
    fn normalize_rejects_bad_domains() {
        assert!(normalize_address("http://peer.example.com").is_err());
        assert!(normalize_address("HTTP://peer.example.com").is_err());
        assert!(normalize_address("").is_err());
        assert!(normalize_address("   ").is_err());
        assert!(normalize_address("ftp://peer.example.com").is_err());
        assert!(normalize_address("https://").is_err());
    }

    #[tokio::test]
    async fn unchanged_registry_only_checks_last_key() {
        let registry = Arc::new(CountingRegistry::new(&["a.com", "b.com", "c.com"]));
        let resolver = MembershipResolver::new(registry.clone());

        let first = resolver.resolve(&MembershipSnapshot::empty()).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(registry.take_reads(), 3);

        let second = resolver.resolve(&first).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(registry.take_reads(), 0);
    }

    #[tokio::test]
    async fn removal_of_last_refetches_only_final_slot() {
        let registry = Arc::new(CountingRegistry::new(&["a.com", "b.com", "c.com"]));
        let resolver = MembershipResolver::new(registry.clone());
        let first = resolver.resolve(&MembershipSnapshot::empty()).await.unwrap();
        registry.take_reads();

        let c = registry.inner.key_at(2).await.unwrap();
        registry.inner.remove(&c);

        let second = resolver.resolve(&first).await.unwrap();
        assert_eq!(addresses(&second), vec!["https://a.com", "https://b.com"]);
        assert_eq!(second.last_count(), 2);
        assert_eq!(registry.take_reads(), 1);
    }

    #[tokio::test]
    async fn removal_by_swap_reuses_moved_entry() {
        let registry = Arc::new(CountingRegistry::new(&["a.com", "b.com", "c.com"]));
        let resolver = MembershipResolver::new(registry.clone());
        let first = resolver.resolve(&MembershipSnapshot::empty()).await.unwrap();
        registry.take_reads();

        let a = registry.inner.key_at(0).await.unwrap();
        registry.inner.remove(&a);

        let second = resolver.resolve(&first).await.unwrap();
        assert_eq!(addresses(&second), vec!["https://b.com", "https://c.com"]);
        assert!(!second.contains(&a));
        // C moved into slot 0 and is reused; only the final slot is read.
        assert_eq!(registry.take_reads(), 1);
    }

    #[tokio::test]
    async fn remove_and_add_detected_by_last_key() {
        let registry = Arc::new(CountingRegistry::new(&["a.com", "b.com"]));
        let resolver = MembershipResolver::new(registry.clone());
        let first = resolver.resolve(&MembershipSnapshot::empty()).await.unwrap();

        let a = registry.inner.key_at(0).await.unwrap();
        registry.inner.remove(&a);
        registry.inner.add("0xowner", "d.com");

        let second = resolver.resolve(&first).await.unwrap();
        assert_eq!(second.last_count(), first.last_count());
        assert_eq!(addresses(&second), vec!["https://b.com", "https://d.com"]);
    }

    #[tokio::test]
    async fn empty_registry_short_circuits() {
        let registry = Arc::new(CountingRegistry::new(&[]));
        let resolver = MembershipResolver::new(registry.clone());

        let snapshot = resolver.resolve(&MembershipSnapshot::empty()).await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.last_entry_key(), None);
        assert_eq!(registry.take_reads(), 0);
    }

    #[tokio::test]
    async fn insecure_and_empty_domains_are_dropped() {
        let registry = Arc::new(CountingRegistry::new(&["http://a.com", "", "c.com"]));
        let resolver = MembershipResolver::new(registry);

        let snapshot = resolver.resolve(&MembershipSnapshot::empty()).await.unwrap();
        assert_eq!(addresses(&snapshot), vec!["https://c.com"]);
        assert_eq!(snapshot.last_count(), 3);
    }

    #[tokio::test]
    async fn registry_failure_propagates() {
        let registry = Arc::new(CountingRegistry::new(&["a.com"]));
        registry.fail.store(true, Ordering::SeqCst);
        let resolver = MembershipResolver::new(registry);

        let result = resolver.resolve(&MembershipSnapshot::empty()).await;
        assert!(matches!(result, Err(Error::Registry(_))));
    }
}
