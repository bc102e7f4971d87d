use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use blockgc_types::{BlockId, GcError};

use crate::BlockCoordinator;

/// Minimal key → block-list namespace sitting in front of the coordinator.
///
/// Only what the deletion pipeline needs: remembering which blocks back a key
/// and handing them to the coordinator when the key is deleted.
pub struct KeyMetadataService<C> {
    coordinator: Arc<C>,
    keys: RwLock<BTreeMap<String, Vec<BlockId>>>,
}

impl<C: BlockCoordinator> KeyMetadataService<C> {
    pub fn new(coordinator: Arc<C>) -> Self {
        KeyMetadataService { coordinator, keys: RwLock::new(BTreeMap::new()) }
    }

    pub async fn put_key(&self, key: &str, blocks: Vec<BlockId>) {
        self.keys.write().await.insert(key.to_string(), blocks);
    }

    pub async fn lookup_key(&self, key: &str) -> Option<Vec<BlockId>> {
        self.keys.read().await.get(key).cloned()
    }

    /// Remove `key` and schedule its blocks for deletion.
    ///
    /// Returns `false` if the key did not exist. If the coordinator rejects the
    /// blocks the namespace entry is restored and the error returned.
    pub async fn delete_key(&self, key: &str) -> Result<bool, GcError> {
        // Not held across the append: deletes of different keys run concurrently.
        let Some(blocks) = self.keys.write().await.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.coordinator.on_key_deleted(blocks.clone()).await {
            tracing::warn!(key, error = %e, "block deletion rejected; key restored");
            // A concurrent put of the same key wins over the restore.
            self.keys.write().await.entry(key.to_string()).or_insert(blocks);
            return Err(e);
        }
        tracing::debug!(key, blocks = blocks.len(), "key deleted");
        Ok(true)
    }
}
