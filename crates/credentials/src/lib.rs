//! Delegated credential store.
//!
//! Credentials are PEM blobs delegated by users, keyed by `delegation_id`.
//! The pipeline treats them as opaque: the worker materializes the PEM on
//! disk right before spawning a copy, and the copy binary points its
//! transport at the file. Issuance and renewal are out of scope — the store
//! only keeps the newest delegation per id.

mod store;

pub use store::{RocksCredentialStore, StoreError};

use serde::{Deserialize, Serialize};

/// A delegated credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub delegation_id: String,
    /// Expiry of the delegated credential.
    pub not_after: fts_types::Timestamp,
    /// PEM-encoded certificate chain and key.
    pub pem: String,
}

/// Storage for delegated credentials.
pub trait CredentialStore: Send + Sync {
    /// The credential for a delegation id, if any.
    fn get(&self, delegation_id: &str) -> Result<Option<Credential>, StoreError>;

    /// Insert or refresh a credential. A stored credential with a later
    /// expiry wins: updating with an older one is a no-op returning `false`.
    fn put(&self, credential: &Credential) -> Result<bool, StoreError>;

    fn delete(&self, delegation_id: &str) -> Result<(), StoreError>;

    /// All known delegation ids.
    fn list(&self) -> Result<Vec<String>, StoreError>;
}
