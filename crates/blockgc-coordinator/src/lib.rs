mod coordinator;
pub mod metadata;
pub mod placement;

use std::collections::BTreeMap;
use std::future::Future;

use blockgc_types::{
    BlockId, ContainerId, ContainerInfo, DeleteTransaction, GcError, NodeId, ReportOutcome, TxnId,
};

pub use coordinator::{ClusterBlockCoordinator, CoordinatorConfig};
pub use metadata::KeyMetadataService;
pub use placement::{ReplicaPlacement, StaticPlacement};

// ---------------------------------------------------------------------------
// BlockCoordinator trait
// Uses RPITIT (Return Position Impl Trait In Trait, stable since Rust 1.75).
// The explicit `+ Send` bound on each future lets the deletion worker spawn
// per-container tasks that call into any implementation.
// ---------------------------------------------------------------------------

pub trait BlockCoordinator: Send + Sync + 'static {
    /// Group `blocks` by container and durably append one transaction per
    /// container. Returns the id assigned to each affected container.
    fn schedule_deletion(
        &self,
        blocks: Vec<BlockId>,
    ) -> impl Future<Output = Result<BTreeMap<ContainerId, TxnId>, GcError>> + Send;

    /// Transactions with id > `after_txn_id`, in increasing id order.
    fn pending_transactions(
        &self,
        container_id: ContainerId,
        after_txn_id: TxnId,
    ) -> impl Future<Output = Result<Vec<DeleteTransaction>, GcError>> + Send;

    /// Record a node's applied watermark. Reports that do not move the
    /// watermark forward come back as `ReportOutcome::Stale`.
    fn report_applied(
        &self,
        node_id: NodeId,
        container_id: ContainerId,
        applied_txn_id: TxnId,
    ) -> impl Future<Output = Result<ReportOutcome, GcError>> + Send;

    fn container_info(
        &self,
        container_id: ContainerId,
    ) -> impl Future<Output = Result<ContainerInfo, GcError>> + Send;

    /// Entry point for the metadata service once a key's namespace entry is
    /// gone. Returns as soon as the transactions are durable; physical purge
    /// happens later on the datanodes.
    fn on_key_deleted(&self, blocks: Vec<BlockId>) -> impl Future<Output = Result<(), GcError>> + Send {
        async move { self.schedule_deletion(blocks).await.map(|_| ()) }
    }
}
