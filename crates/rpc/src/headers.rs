//! Block header checksum validation.

use lru::LruCache;
use opnet_storage::{BlockHeaderStore, StoreError};
use opnet_types::{PartialBlockHeader, StoredBlockHeader};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::{num::NonZeroUsize, sync::Arc};

const HEADER_CACHE_SIZE: usize = 1_024;

/// Validates checksum proofs against stored headers.
///
/// Both queries are idempotent and free of side effects on the caller;
/// absence surfaces as `None`, storage failures propagate.
pub struct BlockHeaderValidator {
    store: Arc<dyn BlockHeaderStore>,
    cache: Mutex<LruCache<u64, StoredBlockHeader>>,
}

impl BlockHeaderValidator {
    pub fn new(store: Arc<dyn BlockHeaderStore>) -> Self {
        let capacity = NonZeroUsize::new(HEADER_CACHE_SIZE).expect("nonzero cache size");
        Self { store, cache: Mutex::new(LruCache::new(capacity)) }
    }

    /// The stored header at `height`, through the cache.
    pub async fn get_block_header(
        &self,
        height: u64,
    ) -> Result<Option<StoredBlockHeader>, StoreError> {
        if let Some(header) = self.cache.lock().get(&height).cloned() {
            return Ok(Some(header));
        }
        let header = self.store.header_at(height).await?;
        if let Some(header) = &header {
            self.cache.lock().put(height, header.clone());
        }
        Ok(header)
    }

    /// Validate a peer-presented partial header against the stored one.
    ///
    /// `None` means no header is stored at that height.
    pub async fn validate_block_checksum(
        &self,
        partial: &PartialBlockHeader,
    ) -> Result<Option<bool>, StoreError> {
        let Some(stored) = self.get_block_header(partial.height).await? else {
            return Ok(None);
        };
        let recomputed = compute_checksum_root(&partial.checksum_proofs, &partial.block_hash);
        let valid = stored.block_hash == partial.block_hash
            && stored.checksum_root == partial.checksum_root
            && recomputed == stored.checksum_root;
        Ok(Some(valid))
    }
}

/// Fold the proof hashes and the block hash into the checksum root.
pub fn compute_checksum_root(proofs: &[[u8; 32]], block_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for proof in proofs {
        hasher.update(proof);
    }
    hasher.update(block_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opnet_storage::MemHeaderStore;

    fn stored_header(height: u64) -> StoredBlockHeader {
        let proofs = vec![[height as u8; 32], [0x55; 32]];
        let block_hash = [0xaa; 32];
        StoredBlockHeader {
            height,
            block_hash,
            checksum_root: compute_checksum_root(&proofs, &block_hash),
            checksum_proofs: proofs,
        }
    }

    fn partial_from(stored: &StoredBlockHeader) -> PartialBlockHeader {
        PartialBlockHeader {
            height: stored.height,
            block_hash: stored.block_hash,
            checksum_root: stored.checksum_root,
            checksum_proofs: stored.checksum_proofs.clone(),
        }
    }

    #[tokio::test]
    async fn valid_proofs_verify() -> eyre::Result<()> {
        let store = Arc::new(MemHeaderStore::new());
        store.insert(stored_header(10));
        let validator = BlockHeaderValidator::new(store);

        let partial = partial_from(&validator.get_block_header(10).await?.unwrap());
        assert_eq!(validator.validate_block_checksum(&partial).await?, Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_root_fails() -> eyre::Result<()> {
        let store = Arc::new(MemHeaderStore::new());
        store.insert(stored_header(10));
        let validator = BlockHeaderValidator::new(store);

        let mut partial = partial_from(&validator.get_block_header(10).await?.unwrap());
        partial.checksum_root[0] ^= 0x01;
        assert_eq!(validator.validate_block_checksum(&partial).await?, Some(false));

        let mut partial = partial_from(&validator.get_block_header(10).await?.unwrap());
        partial.checksum_proofs.pop();
        assert_eq!(validator.validate_block_checksum(&partial).await?, Some(false));
        Ok(())
    }

    #[tokio::test]
    async fn missing_height_is_none() -> eyre::Result<()> {
        let validator = BlockHeaderValidator::new(Arc::new(MemHeaderStore::new()));
        let partial = partial_from(&stored_header(99));
        assert_eq!(validator.validate_block_checksum(&partial).await?, None);
        assert!(validator.get_block_header(99).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn lookups_are_idempotent_and_cached() -> eyre::Result<()> {
        let store = Arc::new(MemHeaderStore::new());
        store.insert(stored_header(10));
        let validator = BlockHeaderValidator::new(store);

        let first = validator.get_block_header(10).await?;
        let second = validator.get_block_header(10).await?;
        assert_eq!(first, second);
        Ok(())
    }
}
