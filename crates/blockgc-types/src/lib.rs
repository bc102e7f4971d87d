use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub type NodeId = u64;
pub type ContainerId = u64;
pub type LocalId = u64;
pub type TxnId = u64;

/// Wall-clock nanoseconds since the Unix epoch; used for record timestamps.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Address of a single block: the container that holds it plus its id inside
/// that container.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct BlockId {
    pub container_id: ContainerId,
    pub local_id: LocalId,
}

impl BlockId {
    pub fn new(container_id: ContainerId, local_id: LocalId) -> Self {
        BlockId { container_id, local_id }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container_id, self.local_id)
    }
}

/// An ordered batch of blocks scheduled for removal from one container.
///
/// `blocks` is sorted and free of duplicates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeleteTransaction {
    pub container_id: ContainerId,
    pub txn_id: TxnId,
    pub blocks: Vec<LocalId>,
}

impl DeleteTransaction {
    pub fn new(container_id: ContainerId, txn_id: TxnId, mut blocks: Vec<LocalId>) -> Self {
        blocks.sort_unstable();
        blocks.dedup();
        DeleteTransaction { container_id, txn_id, blocks }
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().map(|&local_id| BlockId::new(self.container_id, local_id))
    }
}

/// Lifecycle of a block inside a container store:
/// `Present -> PendingDelete -> Purged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlockState {
    Present,
    /// Owning transaction received, payload not yet removed.
    PendingDelete,
    /// Tombstone. Payload is gone; the record stays until reclaimed.
    Purged,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockRecord {
    pub local_id: LocalId,
    pub state: BlockState,
    /// Payload length in bytes at write time.
    pub len: u64,
    pub modified_at_ns: i64,
}

/// Cluster-visible delete progress of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInfo {
    pub container_id: ContainerId,
    pub issued_txn_id: TxnId,
    /// Minimum applied id over every replica placement expects to hold the
    /// container. Never overstates global progress.
    pub min_applied_across_replicas: TxnId,
}

/// Operator view: `ContainerInfo` plus the per-replica breakdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub issued_txn_id: TxnId,
    pub applied_by_replica: BTreeMap<NodeId, TxnId>,
    pub min_applied_across_replicas: TxnId,
}

impl From<&ContainerStatus> for ContainerInfo {
    fn from(status: &ContainerStatus) -> Self {
        ContainerInfo {
            container_id: status.container_id,
            issued_txn_id: status.issued_txn_id,
            min_applied_across_replicas: status.min_applied_across_replicas,
        }
    }
}

/// Result of a watermark report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Advanced { previous: TxnId, current: TxnId },
    /// Report was not above the recorded value and was dropped.
    Stale { recorded: TxnId },
}

/// Result of applying one transaction to a container store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { purged: usize },
    AlreadyApplied,
}

/// Per-state block counts and the watermark of one container replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub present: u64,
    pub pending_delete: u64,
    pub purged: u64,
    pub applied_txn_id: TxnId,
}

#[derive(thiserror::Error, Debug)]
pub enum GcError {
    #[error("unknown container {0}")]
    InvalidContainer(ContainerId),
    #[error("duplicate delete transaction {txn_id} for container {container_id}")]
    DuplicateTransaction { container_id: ContainerId, txn_id: TxnId },
    #[error("purge failed in container {container_id}: {message}")]
    PurgeIo { container_id: ContainerId, message: String },
    #[error("coordinator halted: {0}")]
    Halted(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(
        "container {container_id}: replica at {requested} is behind the log, \
         compacted through {compacted_through}"
    )]
    LogCompacted { container_id: ContainerId, requested: TxnId, compacted_through: TxnId },
}

impl GcError {
    /// Whether the failed operation may succeed if simply retried later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GcError::PurgeIo { .. } | GcError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_blocks_are_sorted_and_deduplicated() {
        let txn = DeleteTransaction::new(7, 1, vec![3, 1, 3, 2]);
        assert_eq!(txn.blocks, vec![1, 2, 3]);
        let ids: Vec<BlockId> = txn.block_ids().collect();
        assert_eq!(ids[0], BlockId::new(7, 1));
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn block_ids_order_by_container_first() {
        assert!(BlockId::new(1, 99) < BlockId::new(2, 0));
        assert_eq!(BlockId::new(4, 2).to_string(), "4:2");
    }

    #[test]
    fn clock_reads_nanoseconds_since_epoch() {
        // Later than 2020-01-01 in nanoseconds.
        assert!(now_ns() > 1_577_836_800_000_000_000);
    }

    #[test]
    fn only_local_failures_are_retriable() {
        assert!(GcError::PurgeIo { container_id: 1, message: "eio".into() }.is_retriable());
        assert!(!GcError::InvalidContainer(1).is_retriable());
        assert!(!GcError::DuplicateTransaction { container_id: 1, txn_id: 1 }.is_retriable());
        let compacted = GcError::LogCompacted { container_id: 1, requested: 2, compacted_through: 5 };
        assert!(!compacted.is_retriable());
        assert!(compacted.to_string().contains("compacted through 5"));
    }
}
