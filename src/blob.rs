//! Byte storage collaborator.
use std::sync::Arc;

use crate::error::DocumentError;

/// Get/put access to raw file bytes. Puts must be idempotent for a given key.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, DocumentError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), DocumentError>;
}

/// Keeps blobs in a dedicated tree of the service database.
#[derive(Clone)]
pub struct SledBlobStore {
    tree: sled::Tree,
}

impl SledBlobStore {
    pub fn open(instance: &Arc<sled::Db>) -> Result<Self, DocumentError> {
        Ok(Self {
            tree: instance.open_tree("blobs")?,
        })
    }
}

impl BlobStore for SledBlobStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, DocumentError> {
        self.tree
            .get(key.as_bytes())?
            .map(|raw| raw.to_vec())
            .ok_or_else(|| DocumentError::Storage(format!("no bytes stored under {key}")))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), DocumentError> {
        self.tree.insert(key.as_bytes(), bytes)?;
        tracing::debug!(key, size = bytes.len(), "stored blob");
        Ok(())
    }
}
