//! Catalyst Storage - byte storage addressed by category and key.
//!
//! The cluster synchronization engine persists three kinds of state: the
//! recent deployment window, the immutable history tail and failed
//! deployment records. None of them need more than a flat key space per
//! category, so the [`Storage`] trait is intentionally small.
//!
//! Two backends are provided:
//!
//! - [`MemoryStorage`]: a `BTreeMap` behind a lock, for tests and ephemeral nodes
//! - [`RocksStorage`]: RocksDB-backed persistent storage
//!
//! Keys inside a category are listed in ascending byte order by both backends.

mod error;
mod memory;
mod rocks;

pub use error::{Error, Result};
pub use memory::MemoryStorage;
pub use rocks::RocksStorage;

/// Byte-oriented storage keyed by `(category, key)`.
pub trait Storage: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(&self, category: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` under `key`, replacing any previous value.
    fn put(&self, category: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Remove the value stored under `key`. Missing keys are not an error.
    fn delete(&self, category: &str, key: &str) -> Result<()>;

    /// All `(key, value)` pairs of a category, in ascending key order.
    fn list(&self, category: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Check whether a value exists under `key`.
    fn exists(&self, category: &str, key: &str) -> Result<bool> {
        Ok(self.get(category, key)?.is_some())
    }
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    fn get(&self, category: &str, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(category, key)
    }

    fn put(&self, category: &str, key: &str, value: &[u8]) -> Result<()> {
        (**self).put(category, key, value)
    }

    fn delete(&self, category: &str, key: &str) -> Result<()> {
        (**self).delete(category, key)
    }

    fn list(&self, category: &str) -> Result<Vec<(String, Vec<u8>)>> {
        (**self).list(category)
    }

    fn exists(&self, category: &str, key: &str) -> Result<bool> {
        (**self).exists(category, key)
    }
}

/// Compose the flat key used by backends without native categories.
pub(crate) fn compose_key(category: &str, key: &str) -> String {
    format!("{}:{}", category, key)
}
