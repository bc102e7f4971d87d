use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use blockgc_types::{
    now_ns, ApplyOutcome, BlockRecord, BlockState, ContainerId, ContainerSummary,
    DeleteTransaction, GcError, LocalId, NodeId, TxnId,
};

use crate::traits::{check_block_write, check_next_txn, ContainerStore, DeleteTransactionLog};
use crate::types::TxnLogState;

// ---------------------------------------------------------------------------
// MemTransactionLog
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemLogInner {
    txns: BTreeMap<(ContainerId, TxnId), DeleteTransaction>,
    issued: BTreeMap<ContainerId, TxnId>,
    progress: BTreeMap<(ContainerId, NodeId), TxnId>,
}

/// In-memory `DeleteTransactionLog` backed by `BTreeMap`s.
///
/// Intended for unit tests; not persisted across restarts. Clones share state,
/// so a clone handed to a second coordinator instance simulates a restart.
#[derive(Clone, Default)]
pub struct MemTransactionLog {
    inner: Arc<RwLock<MemLogInner>>,
}

impl MemTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeleteTransactionLog for MemTransactionLog {
    async fn append(&self, txn: DeleteTransaction) -> Result<(), GcError> {
        let mut g = self.inner.write().await;
        let issued = g.issued.get(&txn.container_id).copied().unwrap_or(0);
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
        g.issued.insert(txn.container_id, txn.txn_id);
        g.txns.insert((txn.container_id, txn.txn_id), txn);
        Ok(())
    }

    async fn read_from(
        &self,
        container_id: ContainerId,
        after_txn_id: TxnId,
    ) -> Result<Vec<DeleteTransaction>, GcError> {
        if after_txn_id == u64::MAX {
            return Ok(Vec::new());
        }
        let g = self.inner.read().await;
        Ok(g.txns
            .range((container_id, after_txn_id + 1)..=(container_id, u64::MAX))
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn truncate_before(&self, container_id: ContainerId, txn_id: TxnId) -> Result<(), GcError> {
        let mut g = self.inner.write().await;
        g.txns.retain(|&(c, id), _| c != container_id || id >= txn_id);
        Ok(())
    }

    async fn issued_txn_id(&self, container_id: ContainerId) -> Result<TxnId, GcError> {
        Ok(self.inner.read().await.issued.get(&container_id).copied().unwrap_or(0))
    }

    async fn log_state(&self, container_id: ContainerId) -> Result<TxnLogState, GcError> {
        let g = self.inner.read().await;
        let mut ids = g
            .txns
            .range((container_id, 0)..=(container_id, u64::MAX))
            .map(|(&(_, id), _)| id);
        let first_txn_id = ids.next();
        let last_txn_id = ids.next_back().or(first_txn_id);
        Ok(TxnLogState {
            first_txn_id,
            last_txn_id,
            issued_txn_id: g.issued.get(&container_id).copied().unwrap_or(0),
        })
    }

    async fn containers(&self) -> Result<Vec<ContainerId>, GcError> {
        Ok(self.inner.read().await.issued.keys().copied().collect())
    }

    async fn save_progress(
        &self,
        container_id: ContainerId,
        node_id: NodeId,
        applied: TxnId,
    ) -> Result<(), GcError> {
        self.inner.write().await.progress.insert((container_id, node_id), applied);
        Ok(())
    }

    async fn load_progress(
        &self,
        container_id: ContainerId,
    ) -> Result<BTreeMap<NodeId, TxnId>, GcError> {
        let g = self.inner.read().await;
        Ok(g.progress
            .range((container_id, 0)..=(container_id, u64::MAX))
            .map(|(&(_, node), &applied)| (node, applied))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemContainerStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemContainerInner {
    records: BTreeMap<LocalId, BlockRecord>,
    chunks: BTreeMap<LocalId, Vec<u8>>,
    applied: TxnId,
    reclaimed_through: Option<LocalId>,
}

/// In-memory `ContainerStore` with purge fault injection.
///
/// While `fail_purges` is set, every purge path returns `PurgeIo` before
/// touching state. `fail_blocks` fails only purges touching those ids.
pub struct MemContainerStore {
    container_id: ContainerId,
    inner: RwLock<MemContainerInner>,
    fail_purges: AtomicBool,
    fail_blocks: std::sync::RwLock<BTreeSet<LocalId>>,
}

impl MemContainerStore {
    pub fn new(container_id: ContainerId) -> Self {
        MemContainerStore {
            container_id,
            inner: RwLock::new(MemContainerInner::default()),
            fail_purges: AtomicBool::new(false),
            fail_blocks: std::sync::RwLock::new(BTreeSet::new()),
        }
    }

    pub fn set_fail_purges(&self, fail: bool) {
        self.fail_purges.store(fail, Ordering::SeqCst);
    }

    pub fn fail_purges_of(&self, local_ids: impl IntoIterator<Item = LocalId>) {
        if let Ok(mut set) = self.fail_blocks.write() {
            set.extend(local_ids);
        }
    }

    pub fn clear_faults(&self) {
        self.set_fail_purges(false);
        if let Ok(mut set) = self.fail_blocks.write() {
            set.clear();
        }
    }

    fn check_fault(&self, local_ids: &[LocalId]) -> Result<(), GcError> {
        let injected = self.fail_purges.load(Ordering::SeqCst)
            || self
                .fail_blocks
                .read()
                .map(|set| local_ids.iter().any(|id| set.contains(id)))
                .unwrap_or(false);
        if injected {
            return Err(GcError::PurgeIo {
                container_id: self.container_id,
                message: "injected purge failure".into(),
            });
        }
        Ok(())
    }
}

fn purge_record(inner: &mut MemContainerInner, local_id: LocalId, now: i64) -> bool {
    match inner.records.get_mut(&local_id) {
        Some(record) if record.state != BlockState::Purged => {
            record.state = BlockState::Purged;
            record.modified_at_ns = now;
            inner.chunks.remove(&local_id);
            true
        }
        _ => false,
    }
}

impl ContainerStore for MemContainerStore {
    fn container_id(&self) -> ContainerId {
        self.container_id
    }

    async fn get(&self, local_id: LocalId) -> Result<Option<BlockRecord>, GcError> {
        Ok(self.inner.read().await.records.get(&local_id).cloned())
    }

    async fn write_block(&self, local_id: LocalId, data: Vec<u8>) -> Result<(), GcError> {
        let mut g = self.inner.write().await;
        let existing = g.records.get(&local_id).map(|r| r.state);
        check_block_write(self.container_id, local_id, existing, g.reclaimed_through)?;
        g.records.insert(
            local_id,
            BlockRecord {
                local_id,
                state: BlockState::Present,
                len: data.len() as u64,
                modified_at_ns: now_ns(),
            },
        );
        g.chunks.insert(local_id, data);
        Ok(())
    }

    async fn read_block(&self, local_id: LocalId) -> Result<Option<Vec<u8>>, GcError> {
        Ok(self.inner.read().await.chunks.get(&local_id).cloned())
    }

    async fn mark_pending_delete(&self, local_ids: &[LocalId]) -> Result<usize, GcError> {
        let mut g = self.inner.write().await;
        let now = now_ns();
        let mut changed = 0;
        for local_id in local_ids {
            if let Some(record) = g.records.get_mut(local_id) {
                if record.state == BlockState::Present {
                    record.state = BlockState::PendingDelete;
                    record.modified_at_ns = now;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn mark_purged(&self, local_id: LocalId) -> Result<(), GcError> {
        self.check_fault(&[local_id])?;
        let mut g = self.inner.write().await;
        purge_record(&mut g, local_id, now_ns());
        Ok(())
    }

    async fn applied_txn_id(&self) -> Result<TxnId, GcError> {
        Ok(self.inner.read().await.applied)
    }

    async fn set_applied_txn_id(&self, txn_id: TxnId) -> Result<(), GcError> {
        let mut g = self.inner.write().await;
        g.applied = g.applied.max(txn_id);
        Ok(())
    }

    async fn apply_transaction(&self, txn: &DeleteTransaction) -> Result<ApplyOutcome, GcError> {
        let mut g = self.inner.write().await;
        if !check_next_txn(self.container_id, g.applied, txn)? {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        self.check_fault(&txn.blocks)?;
        let now = now_ns();
        let purged = txn.blocks.iter().filter(|&&id| purge_record(&mut g, id, now)).count();
        g.applied = txn.txn_id;
        Ok(ApplyOutcome::Applied { purged })
    }

    async fn reclaim_tombstones(&self, older_than_ns: i64) -> Result<usize, GcError> {
        let mut g = self.inner.write().await;
        let stale: Vec<LocalId> = g
            .records
            .values()
            .filter(|r| r.state == BlockState::Purged && r.modified_at_ns < older_than_ns)
            .map(|r| r.local_id)
            .collect();
        for local_id in &stale {
            g.records.remove(local_id);
        }
        if let Some(&highest) = stale.iter().max() {
            g.reclaimed_through = g.reclaimed_through.max(Some(highest));
        }
        Ok(stale.len())
    }

    async fn summary(&self) -> Result<ContainerSummary, GcError> {
        let g = self.inner.read().await;
        let mut summary = ContainerSummary { applied_txn_id: g.applied, ..Default::default() };
        for record in g.records.values() {
            match record.state {
                BlockState::Present => summary.present += 1,
                BlockState::PendingDelete => summary.pending_delete += 1,
                BlockState::Purged => summary.purged += 1,
            }
        }
        Ok(summary)
    }
}
