use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use blockgc_types::{
    now_ns, ApplyOutcome, BlockRecord, BlockState, ContainerId, ContainerSummary,
    DeleteTransaction, GcError, LocalId, NodeId, TxnId,
};

use crate::keys::{block_key, container_prefix, delete_log_key, meta_key, progress_key, split_pair_key};
use crate::traits::{check_block_write, check_next_txn, ContainerStore, DeleteTransactionLog};
use crate::types::TxnLogState;

const APPLIED_LABEL: &str = "applied_txn";
const RECLAIMED_LABEL: &str = "reclaimed_through";

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, GcError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| GcError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, GcError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| GcError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> GcError {
    GcError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> GcError {
    GcError::Storage(e.to_string())
}

fn malformed(what: &str) -> GcError {
    GcError::Storage(format!("malformed {what} key"))
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping all keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic. A coordinator process uses the log keyspaces, a
/// datanode uses the block keyspaces.
pub struct FjallStore {
    pub db: fjall::Database,
    /// Delete transactions: `container(8) ++ txn_id(8)` → bincode(DeleteTransaction)
    pub delete_log: fjall::Keyspace,
    /// Highest issued id per container: `container(8)` → bincode(u64)
    pub issued: fjall::Keyspace,
    /// Reported replica progress: `container(8) ++ node(8)` → bincode(u64)
    pub progress: fjall::Keyspace,
    /// Block records: `container(8) ++ local_id(8)` → bincode(BlockRecord)
    pub blocks: fjall::Keyspace,
    /// Block payloads: `container(8) ++ local_id(8)` → raw bytes
    pub chunks: fjall::Keyspace,
    /// Per-container labels: `container(8) ++ label_utf8` → bincode(value)
    pub meta: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, GcError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let delete_log = db
            .keyspace("delete_log", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let issued =
            db.keyspace("issued", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let progress =
            db.keyspace("progress", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let blocks =
            db.keyspace("blocks", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let chunks =
            db.keyspace("chunks", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, delete_log, issued, progress, blocks, chunks, meta }))
    }

    fn issued_for(&self, container_id: ContainerId) -> Result<TxnId, GcError> {
        match self.issued.get(container_prefix(container_id)).map_err(fjall_err)? {
            Some(b) => decode::<u64>(&b),
            None => Ok(0),
        }
    }

    fn applied_for(&self, container_id: ContainerId) -> Result<TxnId, GcError> {
        match self.meta.get(meta_key(container_id, APPLIED_LABEL)).map_err(fjall_err)? {
            Some(b) => decode::<u64>(&b),
            None => Ok(0),
        }
    }

    fn reclaimed_for(&self, container_id: ContainerId) -> Result<Option<LocalId>, GcError> {
        self.meta
            .get(meta_key(container_id, RECLAIMED_LABEL))
            .map_err(fjall_err)?
            .map(|b| decode::<u64>(&b))
            .transpose()
    }

    fn record(&self, container_id: ContainerId, local_id: LocalId)
        -> Result<Option<BlockRecord>, GcError>
    {
        self.blocks
            .get(block_key(container_id, local_id))
            .map_err(fjall_err)?
            .map(|b| decode::<BlockRecord>(&b))
            .transpose()
    }

    fn container_records(&self, container_id: ContainerId)
        -> Result<Vec<(Vec<u8>, BlockRecord)>, GcError>
    {
        self.blocks
            .prefix(container_prefix(container_id))
            .map(|g| {
                g.into_inner()
                    .map_err(fjall_err)
                    .and_then(|(k, v)| Ok((k.to_vec(), decode::<BlockRecord>(&v)?)))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FjallTransactionLog
// ---------------------------------------------------------------------------

/// `DeleteTransactionLog` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`. The
/// check-then-insert in `append` runs under `append_lock`.
pub struct FjallTransactionLog {
    store: Arc<FjallStore>,
    append_lock: Arc<Mutex<()>>,
}

impl FjallTransactionLog {
    pub fn new(store: Arc<FjallStore>) -> Self {
        FjallTransactionLog { store, append_lock: Arc::new(Mutex::new(())) }
    }
}

impl DeleteTransactionLog for FjallTransactionLog {
    async fn append(&self, txn: DeleteTransaction) -> Result<(), GcError> {
        let store = self.store.clone();
        let lock = self.append_lock.clone();
        tokio::task::spawn_blocking(move || -> Result<(), GcError> {
            let _guard = lock.lock().map_err(|_| GcError::Storage("append lock poisoned".into()))?;
            let issued = store.issued_for(txn.container_id)?;
            if txn.txn_id <= issued {
                return Err(GcError::DuplicateTransaction {
                    container_id: txn.container_id,
                    txn_id: txn.txn_id,
                });
            }
            if txn.txn_id != issued + 1 {
                return Err(GcError::InvalidArgument(format!(
                    "container {}: transaction {} leaves a gap after {issued}",
                    txn.container_id, txn.txn_id
                )));
            }
            let mut batch = store.db.batch();
            batch.insert(
                &store.delete_log,
                delete_log_key(txn.container_id, txn.txn_id).to_vec(),
                encode(&txn)?,
            );
            batch.insert(
                &store.issued,
                container_prefix(txn.container_id).to_vec(),
                encode(&txn.txn_id)?,
            );
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn read_from(
        &self,
        container_id: ContainerId,
        after_txn_id: TxnId,
    ) -> Result<Vec<DeleteTransaction>, GcError> {
        if after_txn_id == u64::MAX {
            return Ok(Vec::new());
        }
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<DeleteTransaction>, GcError> {
            let start = delete_log_key(container_id, after_txn_id + 1).to_vec();
            let end = delete_log_key(container_id, u64::MAX).to_vec();
            store
                .delete_log
                .range(start..=end)
                .map(|g| {
                    g.into_inner()
                        .map_err(fjall_err)
                        .and_then(|(_, v)| decode::<DeleteTransaction>(&v))
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn truncate_before(&self, container_id: ContainerId, txn_id: TxnId) -> Result<(), GcError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<(), GcError> {
            let start = delete_log_key(container_id, 0).to_vec();
            let end = delete_log_key(container_id, txn_id).to_vec();

            let keys: Vec<Vec<u8>> = store
                .delete_log
                .range(start..end)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            if !keys.is_empty() {
                let mut batch = store.db.batch();
                for k in keys {
                    batch.remove(&store.delete_log, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn issued_txn_id(&self, container_id: ContainerId) -> Result<TxnId, GcError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.issued_for(container_id))
            .await
            .map_err(join_err)?
    }

    async fn log_state(&self, container_id: ContainerId) -> Result<TxnLogState, GcError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<TxnLogState, GcError> {
            let mut first_txn_id: Option<TxnId> = None;
            let mut last_txn_id: Option<TxnId> = None;

            for guard in store.delete_log.prefix(container_prefix(container_id)) {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                let (_, txn_id) = split_pair_key(&k).ok_or_else(|| malformed("delete_log"))?;
                if first_txn_id.is_none() {
                    first_txn_id = Some(txn_id);
                }
                last_txn_id = Some(txn_id);
            }

            Ok(TxnLogState {
                first_txn_id,
                last_txn_id,
                issued_txn_id: store.issued_for(container_id)?,
            })
        })
        .await
        .map_err(join_err)?
    }

    async fn containers(&self) -> Result<Vec<ContainerId>, GcError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ContainerId>, GcError> {
            let start = container_prefix(0).to_vec();
            let end = container_prefix(u64::MAX).to_vec();
            store
                .issued
                .range(start..=end)
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, _)| {
                        let bytes: [u8; 8] =
                            k[..].try_into().map_err(|_| malformed("issued"))?;
                        Ok(u64::from_be_bytes(bytes))
                    })
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn save_progress(
        &self,
        container_id: ContainerId,
        node_id: NodeId,
        applied: TxnId,
    ) -> Result<(), GcError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<(), GcError> {
            store
                .progress
                .insert(progress_key(container_id, node_id).to_vec(), encode(&applied)?)
                .map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn load_progress(
        &self,
        container_id: ContainerId,
    ) -> Result<BTreeMap<NodeId, TxnId>, GcError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<BTreeMap<NodeId, TxnId>, GcError> {
            store
                .progress
                .prefix(container_prefix(container_id))
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, v)| {
                        let (_, node_id) =
                            split_pair_key(&k).ok_or_else(|| malformed("progress"))?;
                        Ok((node_id, decode::<u64>(&v)?))
                    })
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// FjallContainerStore
// ---------------------------------------------------------------------------

/// `ContainerStore` for one container inside a node's `FjallStore`.
pub struct FjallContainerStore {
    store: Arc<FjallStore>,
    container_id: ContainerId,
}

impl FjallContainerStore {
    pub fn new(store: Arc<FjallStore>, container_id: ContainerId) -> Self {
        FjallContainerStore { store, container_id }
    }
}

impl ContainerStore for FjallContainerStore {
    fn container_id(&self) -> ContainerId {
        self.container_id
    }

    async fn get(&self, local_id: LocalId) -> Result<Option<BlockRecord>, GcError> {
        let store = self.store.clone();
        let container_id = self.container_id;
        tokio::task::spawn_blocking(move || store.record(container_id, local_id))
            .await
            .map_err(join_err)?
    }

    async fn write_block(&self, local_id: LocalId, data: Vec<u8>) -> Result<(), GcError> {
        let store = self.store.clone();
        let container_id = self.container_id;
        tokio::task::spawn_blocking(move || -> Result<(), GcError> {
            let existing = store.record(container_id, local_id)?.map(|r| r.state);
            check_block_write(container_id, local_id, existing, store.reclaimed_for(container_id)?)?;
            let record = BlockRecord {
                local_id,
                state: BlockState::Present,
                len: data.len() as u64,
                modified_at_ns: now_ns(),
            };
            let key = block_key(container_id, local_id).to_vec();
            let mut batch = store.db.batch();
            batch.insert(&store.chunks, key.clone(), data);
            batch.insert(&store.blocks, key, encode(&record)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn read_block(&self, local_id: LocalId) -> Result<Option<Vec<u8>>, GcError> {
        let store = self.store.clone();
        let container_id = self.container_id;
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, GcError> {
            match store.record(container_id, local_id)? {
                Some(r) if r.state != BlockState::Purged => Ok(store
                    .chunks
                    .get(block_key(container_id, local_id))
                    .map_err(fjall_err)?
                    .map(|b| b.to_vec())),
                _ => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn mark_pending_delete(&self, local_ids: &[LocalId]) -> Result<usize, GcError> {
        let store = self.store.clone();
        let container_id = self.container_id;
        let local_ids = local_ids.to_vec();
        tokio::task::spawn_blocking(move || -> Result<usize, GcError> {
            let now = now_ns();
            let mut changed = 0;
            let mut batch = store.db.batch();
            for local_id in local_ids {
                if let Some(mut record) = store.record(container_id, local_id)? {
                    if record.state == BlockState::Present {
                        record.state = BlockState::PendingDelete;
                        record.modified_at_ns = now;
                        batch.insert(
                            &store.blocks,
                            block_key(container_id, local_id).to_vec(),
                            encode(&record)?,
                        );
                        changed += 1;
                    }
                }
            }
            if changed > 0 {
                batch.commit().map_err(fjall_err)?;
            }
            Ok(changed)
        })
        .await
        .map_err(join_err)?
    }

    async fn mark_purged(&self, local_id: LocalId) -> Result<(), GcError> {
        let store = self.store.clone();
        let container_id = self.container_id;
        tokio::task::spawn_blocking(move || -> Result<(), GcError> {
            if let Some((key, record)) = purged_entry(&store, container_id, local_id, now_ns())? {
                let mut batch = store.db.batch();
                batch.remove(&store.chunks, key.clone());
                batch.insert(&store.blocks, key, record);
                batch.commit().map_err(fjall_err)?;
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn applied_txn_id(&self) -> Result<TxnId, GcError> {
        let store = self.store.clone();
        let container_id = self.container_id;
        tokio::task::spawn_blocking(move || store.applied_for(container_id))
            .await
            .map_err(join_err)?
    }

    async fn set_applied_txn_id(&self, txn_id: TxnId) -> Result<(), GcError> {
        let store = self.store.clone();
        let container_id = self.container_id;
        tokio::task::spawn_blocking(move || -> Result<(), GcError> {
            if txn_id <= store.applied_for(container_id)? {
                return Ok(());
            }
            store
                .meta
                .insert(meta_key(container_id, APPLIED_LABEL), encode(&txn_id)?)
                .map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn apply_transaction(&self, txn: &DeleteTransaction) -> Result<ApplyOutcome, GcError> {
        let store = self.store.clone();
        let container_id = self.container_id;
        let txn = txn.clone();
        tokio::task::spawn_blocking(move || -> Result<ApplyOutcome, GcError> {
            let applied = store.applied_for(container_id)?;
            if !check_next_txn(container_id, applied, &txn)? {
                return Ok(ApplyOutcome::AlreadyApplied);
            }

            let now = now_ns();
            let mut purged = 0;
            let mut batch = store.db.batch();
            for &local_id in &txn.blocks {
                if let Some((key, record)) = purged_entry(&store, container_id, local_id, now)? {
                    batch.remove(&store.chunks, key.clone());
                    batch.insert(&store.blocks, key, record);
                    purged += 1;
                }
            }
            // The watermark lands in the same batch as the purges it covers.
            batch.insert(&store.meta, meta_key(container_id, APPLIED_LABEL), encode(&txn.txn_id)?);
            batch
                .commit()
                .map_err(|e| GcError::PurgeIo { container_id, message: e.to_string() })?;
            Ok(ApplyOutcome::Applied { purged })
        })
        .await
        .map_err(join_err)?
    }

    async fn reclaim_tombstones(&self, older_than_ns: i64) -> Result<usize, GcError> {
        let store = self.store.clone();
        let container_id = self.container_id;
        tokio::task::spawn_blocking(move || -> Result<usize, GcError> {
            let stale: Vec<(Vec<u8>, LocalId)> = store
                .container_records(container_id)?
                .into_iter()
                .filter(|(_, r)| r.state == BlockState::Purged && r.modified_at_ns < older_than_ns)
                .map(|(k, r)| (k, r.local_id))
                .collect();

            let Some(highest) = stale.iter().map(|(_, id)| *id).max() else {
                return Ok(0);
            };
            let count = stale.len();
            let mut batch = store.db.batch();
            for (k, _) in stale {
                batch.remove(&store.blocks, k);
            }
            // The mark moves with the removal so a reclaimed id is never writable.
            if store.reclaimed_for(container_id)? < Some(highest) {
                batch.insert(&store.meta, meta_key(container_id, RECLAIMED_LABEL), encode(&highest)?);
            }
            batch.commit().map_err(fjall_err)?;
            Ok(count)
        })
        .await
        .map_err(join_err)?
    }

    async fn summary(&self) -> Result<ContainerSummary, GcError> {
        let store = self.store.clone();
        let container_id = self.container_id;
        tokio::task::spawn_blocking(move || -> Result<ContainerSummary, GcError> {
            let mut summary = ContainerSummary {
                applied_txn_id: store.applied_for(container_id)?,
                ..ContainerSummary::default()
            };
            for (_, record) in store.container_records(container_id)? {
                match record.state {
                    BlockState::Present => summary.present += 1,
                    BlockState::PendingDelete => summary.pending_delete += 1,
                    BlockState::Purged => summary.purged += 1,
                }
            }
            Ok(summary)
        })
        .await
        .map_err(join_err)?
    }
}

/// Key and encoded tombstone for purging one block, or `None` when there is
/// nothing to do (absent or already a tombstone).
fn purged_entry(
    store: &FjallStore,
    container_id: ContainerId,
    local_id: LocalId,
    now: i64,
) -> Result<Option<(Vec<u8>, Vec<u8>)>, GcError> {
    let Some(mut record) = store.record(container_id, local_id)? else {
        return Ok(None);
    };
    if record.state == BlockState::Purged {
        return Ok(None);
    }
    record.state = BlockState::Purged;
    record.modified_at_ns = now;
    Ok(Some((block_key(container_id, local_id).to_vec(), encode(&record)?)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &std::path::Path) -> Arc<FjallStore> {
        FjallStore::open(dir).expect("open store")
    }

    // -----------------------------------------------------------------------
    // FjallTransactionLog
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn log_append_and_read_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = FjallTransactionLog::new(open_store(dir.path()));

        for id in 1..=3 {
            log.append(DeleteTransaction::new(5, id, vec![id * 10])).await.unwrap();
        }

        let all = log.read_from(5, 0).await.unwrap();
        assert_eq!(all.iter().map(|t| t.txn_id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let tail = log.read_from(5, 2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].blocks, vec![30]);

        assert!(log.read_from(6, 0).await.unwrap().is_empty());
        assert_eq!(log.issued_txn_id(5).await.unwrap(), 3);
        assert_eq!(log.issued_txn_id(6).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn log_rejects_duplicates_and_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let log = FjallTransactionLog::new(open_store(dir.path()));

        log.append(DeleteTransaction::new(1, 1, vec![1])).await.unwrap();
        let err = log.append(DeleteTransaction::new(1, 1, vec![2])).await.unwrap_err();
        assert!(matches!(err, GcError::DuplicateTransaction { container_id: 1, txn_id: 1 }));

        let err = log.append(DeleteTransaction::new(1, 3, vec![2])).await.unwrap_err();
        assert!(matches!(err, GcError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn log_truncate_keeps_issued_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let log = FjallTransactionLog::new(open_store(dir.path()));

        for id in 1..=4 {
            log.append(DeleteTransaction::new(2, id, vec![id])).await.unwrap();
        }
        log.truncate_before(2, 3).await.unwrap();

        let state = log.log_state(2).await.unwrap();
        assert_eq!(state.first_txn_id, Some(3));
        assert_eq!(state.last_txn_id, Some(4));
        assert_eq!(state.issued_txn_id, 4);

        // A truncated id can never be re-appended.
        let err = log.append(DeleteTransaction::new(2, 1, vec![9])).await.unwrap_err();
        assert!(matches!(err, GcError::DuplicateTransaction { .. }));
        log.append(DeleteTransaction::new(2, 5, vec![5])).await.unwrap();
    }

    #[tokio::test]
    async fn log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FjallTransactionLog::new(open_store(dir.path()));
            log.append(DeleteTransaction::new(1, 1, vec![1, 2])).await.unwrap();
            log.append(DeleteTransaction::new(9, 1, vec![4])).await.unwrap();
            log.save_progress(1, 100, 1).await.unwrap();
        }
        let log = FjallTransactionLog::new(open_store(dir.path()));
        assert_eq!(log.containers().await.unwrap(), vec![1, 9]);
        assert_eq!(log.read_from(1, 0).await.unwrap()[0].blocks, vec![1, 2]);
        let progress = log.load_progress(1).await.unwrap();
        assert_eq!(progress.get(&100), Some(&1));
        assert!(log.load_progress(9).await.unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // FjallContainerStore
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn block_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let cs = FjallContainerStore::new(open_store(dir.path()), 1);

        cs.write_block(1, b"payload".to_vec()).await.unwrap();
        assert_eq!(cs.get(1).await.unwrap().unwrap().state, BlockState::Present);
        assert_eq!(cs.read_block(1).await.unwrap().unwrap(), b"payload");

        assert_eq!(cs.mark_pending_delete(&[1, 2]).await.unwrap(), 1);
        assert_eq!(cs.get(1).await.unwrap().unwrap().state, BlockState::PendingDelete);

        cs.mark_purged(1).await.unwrap();
        cs.mark_purged(1).await.unwrap();
        cs.mark_purged(2).await.unwrap();
        let record = cs.get(1).await.unwrap().unwrap();
        assert_eq!(record.state, BlockState::Purged);
        assert_eq!(record.len, 7);
        assert!(cs.read_block(1).await.unwrap().is_none());
        assert!(cs.get(2).await.unwrap().is_none());

        let err = cs.write_block(1, b"again".to_vec()).await.unwrap_err();
        assert!(matches!(err, GcError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn apply_transaction_advances_watermark_once() {
        let dir = tempfile::tempdir().unwrap();
        let cs = FjallContainerStore::new(open_store(dir.path()), 3);
        for id in 1..=3 {
            cs.write_block(id, vec![id as u8]).await.unwrap();
        }

        let txn = DeleteTransaction::new(3, 1, vec![1, 2, 99]);
        assert_eq!(cs.apply_transaction(&txn).await.unwrap(), ApplyOutcome::Applied { purged: 2 });
        let after_first = cs.summary().await.unwrap();

        assert_eq!(cs.apply_transaction(&txn).await.unwrap(), ApplyOutcome::AlreadyApplied);
        assert_eq!(cs.summary().await.unwrap(), after_first);
        assert_eq!(
            after_first,
            ContainerSummary { present: 1, pending_delete: 0, purged: 2, applied_txn_id: 1 }
        );

        let gap = DeleteTransaction::new(3, 3, vec![3]);
        assert!(matches!(cs.apply_transaction(&gap).await, Err(GcError::InvalidArgument(_))));
        let foreign = DeleteTransaction::new(4, 2, vec![3]);
        assert!(matches!(cs.apply_transaction(&foreign).await, Err(GcError::InvalidArgument(_))));
        assert_eq!(cs.applied_txn_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn watermark_is_monotonic_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cs = FjallContainerStore::new(open_store(dir.path()), 8);
            cs.set_applied_txn_id(4).await.unwrap();
            cs.set_applied_txn_id(2).await.unwrap();
            assert_eq!(cs.applied_txn_id().await.unwrap(), 4);
        }
        let cs = FjallContainerStore::new(open_store(dir.path()), 8);
        assert_eq!(cs.applied_txn_id().await.unwrap(), 4);
        let other = FjallContainerStore::new(cs.store.clone(), 9);
        assert_eq!(other.applied_txn_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reclaim_drops_only_old_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let cs = FjallContainerStore::new(open_store(dir.path()), 1);
        cs.write_block(1, vec![1]).await.unwrap();
        cs.write_block(2, vec![2]).await.unwrap();
        cs.mark_purged(1).await.unwrap();

        assert_eq!(cs.reclaim_tombstones(0).await.unwrap(), 0);
        assert_eq!(cs.reclaim_tombstones(i64::MAX).await.unwrap(), 1);
        assert!(cs.get(1).await.unwrap().is_none());
        assert_eq!(cs.get(2).await.unwrap().unwrap().state, BlockState::Present);
    }

    #[tokio::test]
    async fn reclaimed_ids_cannot_be_rewritten_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cs = FjallContainerStore::new(open_store(dir.path()), 1);
            for id in 1..=3 {
                cs.write_block(id, vec![id as u8]).await.unwrap();
            }
            cs.apply_transaction(&DeleteTransaction::new(1, 1, vec![2])).await.unwrap();
            assert_eq!(cs.reclaim_tombstones(i64::MAX).await.unwrap(), 1);
        }

        let cs = FjallContainerStore::new(open_store(dir.path()), 1);
        assert!(cs.get(2).await.unwrap().is_none());
        let err = cs.write_block(2, vec![0]).await.unwrap_err();
        assert!(matches!(err, GcError::InvalidArgument(_)));
        cs.write_block(3, vec![30]).await.unwrap();
        cs.write_block(4, vec![4]).await.unwrap();
        assert_eq!(cs.read_block(3).await.unwrap(), Some(vec![30]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn containers_in_one_store_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let a = FjallContainerStore::new(store.clone(), 1);
        let b = FjallContainerStore::new(store, 2);
        a.write_block(1, vec![1]).await.unwrap();
        b.write_block(1, vec![2]).await.unwrap();

        a.apply_transaction(&DeleteTransaction::new(1, 1, vec![1])).await.unwrap();
        assert_eq!(a.get(1).await.unwrap().unwrap().state, BlockState::Purged);
        assert_eq!(b.get(1).await.unwrap().unwrap().state, BlockState::Present);
        assert_eq!(b.applied_txn_id().await.unwrap(), 0);
    }
}
