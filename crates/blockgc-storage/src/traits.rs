use std::collections::BTreeMap;
use std::future::Future;

use blockgc_types::{
    ApplyOutcome, BlockRecord, BlockState, ContainerId, ContainerSummary, DeleteTransaction,
    GcError, LocalId, NodeId, TxnId,
};

use crate::types::TxnLogState;

/// Durable, append-only record of the delete transactions issued per
/// container, plus the replica progress the coordinator has accepted.
///
/// Methods use RPITIT (`-> impl Future + Send`) so callers stay generic
/// without an `async-trait` dependency.
pub trait DeleteTransactionLog: Send + Sync + 'static {
    /// Append a transaction. Fails with `DuplicateTransaction` if its id is
    /// already present, or was present and has since been truncated.
    fn append(&self, txn: DeleteTransaction)
        -> impl Future<Output = Result<(), GcError>> + Send;

    /// All transactions with `txn_id > after_txn_id`, in increasing id order.
    fn read_from(&self, container_id: ContainerId, after_txn_id: TxnId)
        -> impl Future<Output = Result<Vec<DeleteTransaction>, GcError>> + Send;

    /// Drop every transaction with `txn_id < txn_id`. The issued watermark is
    /// kept.
    fn truncate_before(&self, container_id: ContainerId, txn_id: TxnId)
        -> impl Future<Output = Result<(), GcError>> + Send;

    /// Highest id ever appended for the container, 0 if none.
    fn issued_txn_id(&self, container_id: ContainerId)
        -> impl Future<Output = Result<TxnId, GcError>> + Send;

    fn log_state(&self, container_id: ContainerId)
        -> impl Future<Output = Result<TxnLogState, GcError>> + Send;

    /// Every container that has had at least one transaction appended.
    fn containers(&self) -> impl Future<Output = Result<Vec<ContainerId>, GcError>> + Send;

    /// Persist the applied watermark a node reported for a container.
    fn save_progress(&self, container_id: ContainerId, node_id: NodeId, applied: TxnId)
        -> impl Future<Output = Result<(), GcError>> + Send;

    fn load_progress(&self, container_id: ContainerId)
        -> impl Future<Output = Result<BTreeMap<NodeId, TxnId>, GcError>> + Send;
}

/// One container replica on one node: block records, payloads, and the
/// applied delete-transaction watermark.
///
/// Only the deletion worker responsible for the replica mutates it.
pub trait ContainerStore: Send + Sync + 'static {
    fn container_id(&self) -> ContainerId;

    /// Return the record for `local_id`, tombstones included.
    fn get(&self, local_id: LocalId)
        -> impl Future<Output = Result<Option<BlockRecord>, GcError>> + Send;

    /// Store a block payload and mark it `Present`.
    ///
    /// Local ids are allocated in increasing order and never reused: writing
    /// over a tombstone, or any missing id at or below the highest reclaimed
    /// tombstone, fails with `InvalidArgument`.
    fn write_block(&self, local_id: LocalId, data: Vec<u8>)
        -> impl Future<Output = Result<(), GcError>> + Send;

    /// Payload of a live block. `None` once purged or if never written.
    fn read_block(&self, local_id: LocalId)
        -> impl Future<Output = Result<Option<Vec<u8>>, GcError>> + Send;

    /// Move `Present` records to `PendingDelete`. Other states and missing
    /// records are left alone. Returns how many records changed.
    fn mark_pending_delete(&self, local_ids: &[LocalId])
        -> impl Future<Output = Result<usize, GcError>> + Send;

    /// Remove the payload and tombstone the record. No-op if already purged
    /// or absent.
    fn mark_purged(&self, local_id: LocalId)
        -> impl Future<Output = Result<(), GcError>> + Send;

    fn applied_txn_id(&self) -> impl Future<Output = Result<TxnId, GcError>> + Send;

    /// Raise the applied watermark. Values at or below the current one are
    /// ignored.
    fn set_applied_txn_id(&self, txn_id: TxnId)
        -> impl Future<Output = Result<(), GcError>> + Send;

    /// Purge every block of `txn` and set the watermark to `txn.txn_id` as a
    /// single atomic unit.
    ///
    /// * `txn_id <= applied`     → `AlreadyApplied`, nothing changes.
    /// * `txn_id >  applied + 1` → `InvalidArgument`, ids are never skipped.
    fn apply_transaction(&self, txn: &DeleteTransaction)
        -> impl Future<Output = Result<ApplyOutcome, GcError>> + Send;

    /// Delete tombstones last modified before `older_than_ns` and raise the
    /// reclaimed high-water id. Returns the number removed.
    fn reclaim_tombstones(&self, older_than_ns: i64)
        -> impl Future<Output = Result<usize, GcError>> + Send;

    fn summary(&self) -> impl Future<Output = Result<ContainerSummary, GcError>> + Send;
}

/// Shared precondition check for `ContainerStore::apply_transaction`.
///
/// Returns `Ok(true)` if the transaction must be applied, `Ok(false)` if it is
/// already covered by the watermark.
pub(crate) fn check_next_txn(
    container_id: ContainerId,
    applied: TxnId,
    txn: &DeleteTransaction,
) -> Result<bool, GcError> {
    if txn.container_id != container_id {
        return Err(GcError::InvalidArgument(format!(
            "transaction {} targets container {}, store holds {}",
            txn.txn_id, txn.container_id, container_id
        )));
    }
    if txn.txn_id <= applied {
        return Ok(false);
    }
    if txn.txn_id != applied + 1 {
        return Err(GcError::InvalidArgument(format!(
            "container {container_id}: transaction {} does not follow applied watermark {applied}",
            txn.txn_id
        )));
    }
    Ok(true)
}

/// Shared precondition check for `ContainerStore::write_block`.
///
/// `existing` is the current record state, `reclaimed_through` the highest
/// local id whose tombstone has been reclaimed.
pub(crate) fn check_block_write(
    container_id: ContainerId,
    local_id: LocalId,
    existing: Option<BlockState>,
    reclaimed_through: Option<LocalId>,
) -> Result<(), GcError> {
    match (existing, reclaimed_through) {
        (Some(BlockState::Present), _) => Ok(()),
        (Some(state), _) => Err(GcError::InvalidArgument(format!(
            "block {container_id}:{local_id} is {state:?}, ids are not reused"
        ))),
        (None, Some(r)) if local_id <= r => Err(GcError::InvalidArgument(format!(
            "block {container_id}:{local_id} is at or below reclaimed id {r}, ids are not reused"
        ))),
        (None, _) => Ok(()),
    }
}
