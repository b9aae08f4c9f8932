//! Backing stores for the echelon tree.
//!
//! Keys encode the leaf path; values encode the FIFO contents as a JSON
//! array. The whole structure is rebuilt by scanning all keys on startup.

use redis::Commands;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Separator between route segments inside a key. Storage names contain
/// slashes and colons, so an ASCII unit separator keeps parsing unambiguous.
const SEGMENT_SEPARATOR: u8 = 0x1f;
const LEAF_PREFIX: &[u8] = b"leaf:";

/// Errors from a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rocksdb: {0}")]
    Rocks(String),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Key addressing the leaf at `route`.
pub(crate) fn leaf_key(route: &[String]) -> Vec<u8> {
    let mut key = LEAF_PREFIX.to_vec();
    for (i, segment) in route.iter().enumerate() {
        if i > 0 {
            key.push(SEGMENT_SEPARATOR);
        }
        key.extend_from_slice(segment.as_bytes());
    }
    key
}

/// Inverse of [`leaf_key`]. Foreign keys yield an empty route.
pub(crate) fn parse_leaf_key(key: &[u8]) -> Vec<String> {
    let Some(path) = key.strip_prefix(LEAF_PREFIX) else {
        return Vec::new();
    };
    path.split(|&b| b == SEGMENT_SEPARATOR)
        .map(|segment| String::from_utf8_lossy(segment).into_owned())
        .collect()
}

/// Durable key-value storage for leaf queues.
pub trait TreeStore: Send + Sync {
    /// Write a leaf. Durable when the call returns.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    /// All leaves, for [`restore`](crate::Echelon::open).
    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory store (tests)
// ═══════════════════════════════════════════════════════════════════════

/// Process-local store. Clones share contents, which lets tests simulate a
/// restart by reopening an echelon over the same store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl TreeStore for MemoryStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// RocksDB store
// ═══════════════════════════════════════════════════════════════════════

/// Embedded store for single-host deployments (`--EchelonDir`).
pub struct RocksStore {
    db: rocksdb::DB,
}

impl RocksStore {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path).map_err(|e| StoreError::Rocks(e.to_string()))?;
        Ok(Self { db })
    }

    fn write_opts() -> rocksdb::WriteOptions {
        // Queue contents must survive a crash of the scheduler host.
        let mut opts = rocksdb::WriteOptions::default();
        opts.set_sync(true);
        opts
    }
}

impl TreeStore for RocksStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db
            .put_opt(key, value, &Self::write_opts())
            .map_err(|e| StoreError::Rocks(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db
            .delete_opt(key, &Self::write_opts())
            .map_err(|e| StoreError::Rocks(e.to_string()))
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut entries = Vec::new();
        for item in self.db.iterator(rocksdb::IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Rocks(e.to_string()))?;
            entries.push((key.into_vec(), value.into_vec()));
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Rocks(e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Redis store
// ═══════════════════════════════════════════════════════════════════════

/// Remote store (`--Redis`), keys namespaced under a prefix so the same
/// instance can carry the scoreboard too.
pub struct RedisStore {
    connection: Mutex<redis::Connection>,
    prefix: Vec<u8>,
}

impl RedisStore {
    pub const DEFAULT_PREFIX: &'static str = "fts-sched-";

    /// Connect to `host:port`.
    pub fn open(addr: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(format!("redis://{addr}/"))?;
        let connection = client.get_connection()?;
        Ok(Self {
            connection: Mutex::new(connection),
            prefix: prefix.as_bytes().to_vec(),
        })
    }

    fn prefixed(&self, key: &[u8]) -> Vec<u8> {
        let mut full = self.prefix.clone();
        full.extend_from_slice(key);
        full
    }
}

impl TreeStore for RedisStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut connection = self.connection.lock().unwrap();
        connection.set::<_, _, ()>(self.prefixed(key), value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut connection = self.connection.lock().unwrap();
        connection.del::<_, ()>(self.prefixed(key))?;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut connection = self.connection.lock().unwrap();
        let mut pattern = self.prefix.clone();
        pattern.extend_from_slice(b"*");

        let keys: Vec<Vec<u8>> = {
            let iter = connection.scan_match::<_, Vec<u8>>(pattern)?;
            iter.collect()
        };

        let mut entries = Vec::with_capacity(keys.len());
        for full_key in keys {
            let value: Option<Vec<u8>> = connection.get(&full_key)?;
            if let Some(value) = value {
                let key = full_key[self.prefix.len()..].to_vec();
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_key_roundtrip() {
        let route = vec![
            "mock://b".to_string(),
            "atlas".to_string(),
            "default".to_string(),
            "mock://a".to_string(),
        ];
        let key = leaf_key(&route);
        assert_eq!(parse_leaf_key(&key), route);
    }

    #[test]
    fn foreign_keys_are_ignored() {
        assert!(parse_leaf_key(b"meta:version").is_empty());
    }
}
