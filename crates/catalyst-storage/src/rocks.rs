//! Persistent storage using RocksDB.

use crate::error::Result;
use crate::{compose_key, Storage};
use rocksdb::{Options, DB};
use std::path::Path;

/// RocksDB storage backend. Categories are key prefixes (`{category}:{key}`).
pub struct RocksStorage {
    db: DB,
}

impl RocksStorage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        tracing::debug!("opened rocksdb storage");
        Ok(Self { db })
    }
}

impl Storage for RocksStorage {
    fn get(&self, category: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let key = compose_key(category, key);
        Ok(self.db.get(key.as_bytes())?)
    }

    fn put(&self, category: &str, key: &str, value: &[u8]) -> Result<()> {
        let key = compose_key(category, key);
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, category: &str, key: &str) -> Result<()> {
        let key = compose_key(category, key);
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    fn list(&self, category: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = compose_key(category, "");
        let mut entries = Vec::new();

        let iter = self.db.prefix_iterator(prefix.as_bytes());
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key_str = String::from_utf8_lossy(&key);
            if let Some(stripped) = key_str.strip_prefix(prefix.as_str()) {
                entries.push((stripped.to_string(), value.to_vec()));
            }
        }

        Ok(entries)
    }
}
