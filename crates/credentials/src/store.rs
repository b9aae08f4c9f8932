//! RocksDB-backed credential store.

use crate::{Credential, CredentialStore};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors from the credential store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(String),

    #[error("corrupt credential entry for {delegation_id}: {reason}")]
    Corrupt {
        delegation_id: String,
        reason: String,
    },
}

/// Embedded store, one entry per delegation id.
pub struct RocksCredentialStore {
    db: rocksdb::DB,
}

impl RocksCredentialStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db =
            rocksdb::DB::open(&opts, path).map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { db })
    }
}

impl CredentialStore for RocksCredentialStore {
    fn get(&self, delegation_id: &str) -> Result<Option<Credential>, StoreError> {
        let raw = self
            .db
            .get(delegation_id.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?;
        match raw {
            Some(bytes) => {
                let credential =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                        delegation_id: delegation_id.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(credential))
            }
            None => Ok(None),
        }
    }

    fn put(&self, credential: &Credential) -> Result<bool, StoreError> {
        if let Some(existing) = self.get(&credential.delegation_id)? {
            let existing_expiry = existing.not_after.to_system_time();
            if existing_expiry > credential.not_after.to_system_time() {
                debug!(
                    delegation_id = %credential.delegation_id,
                    "stored credential is newer, ignoring update"
                );
                return Ok(false);
            }
        }
        let bytes =
            serde_json::to_vec(credential).map_err(|e| StoreError::Database(e.to_string()))?;
        self.db
            .put(credential.delegation_id.as_bytes(), bytes)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(true)
    }

    fn delete(&self, delegation_id: &str) -> Result<(), StoreError> {
        self.db
            .delete(delegation_id.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for item in self.db.iterator(rocksdb::IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            ids.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fts_types::Timestamp;
    use tempfile::TempDir;

    fn credential(id: &str, expiry_secs: i64) -> Credential {
        Credential {
            delegation_id: id.to_string(),
            not_after: Timestamp {
                seconds: expiry_secs,
                nanos: 0,
            },
            pem: format!("-----BEGIN CERTIFICATE-----\n{id}\n-----END CERTIFICATE-----\n"),
        }
    }

    #[test]
    fn put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = RocksCredentialStore::open(dir.path()).unwrap();

        assert!(store.get("d1").unwrap().is_none());
        assert!(store.put(&credential("d1", 1000)).unwrap());
        assert_eq!(store.get("d1").unwrap().unwrap(), credential("d1", 1000));

        store.delete("d1").unwrap();
        assert!(store.get("d1").unwrap().is_none());
    }

    #[test]
    fn newer_credential_wins() {
        let dir = TempDir::new().unwrap();
        let store = RocksCredentialStore::open(dir.path()).unwrap();

        assert!(store.put(&credential("d1", 2000)).unwrap());
        // An older delegation does not replace the stored one.
        assert!(!store.put(&credential("d1", 1000)).unwrap());
        assert_eq!(
            store.get("d1").unwrap().unwrap().not_after.seconds,
            2000
        );
        // A newer one does.
        assert!(store.put(&credential("d1", 3000)).unwrap());
    }

    #[test]
    fn list_ids() {
        let dir = TempDir::new().unwrap();
        let store = RocksCredentialStore::open(dir.path()).unwrap();
        store.put(&credential("a", 1)).unwrap();
        store.put(&credential("b", 1)).unwrap();
        let mut ids = store.list().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
