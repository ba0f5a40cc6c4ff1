//! Storage collaborator traits.
//!
//! The node consumes repositories through these seams; the backing database
//! lives outside this workspace. The in-memory implementations back tests and
//! nodes running without a configured repository.

use async_trait::async_trait;
use opnet_types::StoredBlockHeader;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors surfaced by storage collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("value codec: {0}")]
    Codec(String),
}

/// Keyed collections of opaque values, the `KV/Collection` seam.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, collection: &str, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, key: &[u8]) -> Result<(), StoreError>;
}

/// Lookup of persisted block headers by height.
#[async_trait]
pub trait BlockHeaderStore: Send + Sync + 'static {
    async fn header_at(&self, height: u64) -> Result<Option<StoredBlockHeader>, StoreError>;
}

/// In-memory [KeyValueStore].
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemStore {
    async fn get(&self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.read().get(collection).and_then(|c| c.get(key).cloned()))
    }

    async fn put(&self, collection: &str, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.inner.write().entry(collection.to_string()).or_default().insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &[u8]) -> Result<(), StoreError> {
        if let Some(c) = self.inner.write().get_mut(collection) {
            c.remove(key);
        }
        Ok(())
    }
}

/// In-memory [BlockHeaderStore].
#[derive(Default)]
pub struct MemHeaderStore {
    headers: RwLock<BTreeMap<u64, StoredBlockHeader>>,
}

impl MemHeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, header: StoredBlockHeader) {
        self.headers.write().insert(header.height, header);
    }
}

#[async_trait]
impl BlockHeaderStore for MemHeaderStore {
    async fn header_at(&self, height: u64) -> Result<Option<StoredBlockHeader>, StoreError> {
        Ok(self.headers.read().get(&height).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_store_round_trip() -> eyre::Result<()> {
        let store = MemStore::new();
        assert_eq!(store.get("c", b"k").await?, None);
        store.put("c", b"k", b"v".to_vec()).await?;
        assert_eq!(store.get("c", b"k").await?, Some(b"v".to_vec()));
        // collections are isolated
        assert_eq!(store.get("other", b"k").await?, None);
        store.delete("c", b"k").await?;
        assert_eq!(store.get("c", b"k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn header_store_lookup() -> eyre::Result<()> {
        let store = MemHeaderStore::new();
        assert!(store.header_at(10).await?.is_none());
        store.insert(StoredBlockHeader {
            height: 10,
            block_hash: [1u8; 32],
            checksum_root: [2u8; 32],
            checksum_proofs: vec![[3u8; 32]],
        });
        let header = store.header_at(10).await?.unwrap();
        assert_eq!(header.block_hash, [1u8; 32]);
        Ok(())
    }
}
