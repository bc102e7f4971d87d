use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, RwLock};

use blockgc_storage::DeleteTransactionLog;
use blockgc_types::{
    BlockId, ContainerId, ContainerInfo, ContainerStatus, DeleteTransaction, GcError, LocalId,
    NodeId, ReportOutcome, TxnId,
};

use crate::placement::ReplicaPlacement;
use crate::BlockCoordinator;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CoordinatorConfig {
    /// Drop log entries every expected or previously reporting replica has
    /// applied.
    pub compact_log: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig { compact_log: true }
    }
}

#[derive(Default)]
struct ContainerState {
    issued: TxnId,
    applied: BTreeMap<NodeId, TxnId>,
    /// Every id `<= compacted_through` has been truncated from the log.
    compacted_through: TxnId,
}

impl ContainerState {
    fn min_applied<'a>(&self, replicas: impl IntoIterator<Item = &'a NodeId>) -> TxnId {
        replicas
            .into_iter()
            .map(|n| self.applied.get(n).copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    /// Highest id every interested node has applied: the expected replicas
    /// plus any node that has ever reported. A replica that briefly drops out
    /// of placement still pins the log at its watermark.
    fn compaction_floor(&self, replicas: &BTreeSet<NodeId>) -> TxnId {
        self.min_applied(replicas.iter().chain(self.applied.keys()))
    }
}

/// Cluster-wide authority over delete transactions.
///
/// Id assignment is serialized per container by that container's mutex; the
/// outer map lock is only held to look up or insert an entry, so different
/// containers proceed in parallel.
pub struct ClusterBlockCoordinator<L, P> {
    log: L,
    placement: P,
    config: CoordinatorConfig,
    containers: RwLock<HashMap<ContainerId, Arc<Mutex<ContainerState>>>>,
    halted: OnceLock<String>,
}

impl<L: DeleteTransactionLog, P: ReplicaPlacement> ClusterBlockCoordinator<L, P> {
    /// Build a coordinator, loading issued watermarks and replica progress
    /// for every container the log has seen.
    pub async fn open(log: L, placement: P, config: CoordinatorConfig) -> Result<Self, GcError> {
        let mut containers = HashMap::new();
        for container_id in log.containers().await? {
            let state = log.log_state(container_id).await?;
            let applied = log.load_progress(container_id).await?;
            let compacted_through = state.first_txn_id.map(|f| f - 1).unwrap_or(state.issued_txn_id);
            containers.insert(
                container_id,
                Arc::new(Mutex::new(ContainerState {
                    issued: state.issued_txn_id,
                    applied,
                    compacted_through,
                })),
            );
        }
        tracing::info!(containers = containers.len(), "block coordinator loaded");
        Ok(ClusterBlockCoordinator {
            log,
            placement,
            config,
            containers: RwLock::new(containers),
            halted: OnceLock::new(),
        })
    }

    pub fn is_halted(&self) -> bool {
        self.halted.get().is_some()
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Operator view of one container, including every expected replica's
    /// applied id (0 for replicas that have never reported).
    pub async fn container_status(&self, container_id: ContainerId) -> Result<ContainerStatus, GcError> {
        let replicas = self
            .placement
            .replicas_of(container_id)
            .ok_or(GcError::InvalidContainer(container_id))?;
        let state = self.state(container_id).await;
        let g = state.lock().await;
        Ok(ContainerStatus {
            container_id,
            issued_txn_id: g.issued,
            applied_by_replica: replicas
                .iter()
                .map(|n| (*n, g.applied.get(n).copied().unwrap_or(0)))
                .collect(),
            min_applied_across_replicas: g.min_applied(&replicas),
        })
    }

    /// Status of every container known to placement.
    pub async fn list_containers(&self) -> Result<Vec<ContainerStatus>, GcError> {
        let mut out = Vec::new();
        for container_id in self.placement.containers() {
            out.push(self.container_status(container_id).await?);
        }
        Ok(out)
    }

    fn ensure_known(&self, container_id: ContainerId) -> Result<(), GcError> {
        match self.placement.replicas_of(container_id) {
            Some(_) => Ok(()),
            None => Err(GcError::InvalidContainer(container_id)),
        }
    }

    async fn state(&self, container_id: ContainerId) -> Arc<Mutex<ContainerState>> {
        if let Some(s) = self.containers.read().await.get(&container_id) {
            return s.clone();
        }
        self.containers.write().await.entry(container_id).or_default().clone()
    }

    fn halt(&self, err: &GcError) {
        let reason = err.to_string();
        tracing::error!(error = %reason, "delete log integrity violated; coordinator halting");
        let _ = self.halted.set(reason);
    }

    async fn append_next(
        &self,
        container_id: ContainerId,
        blocks: Vec<LocalId>,
    ) -> Result<TxnId, GcError> {
        let state = self.state(container_id).await;
        let mut g = state.lock().await;
        let txn_id = g.issued + 1;
        let txn = DeleteTransaction::new(container_id, txn_id, blocks);
        let block_count = txn.blocks.len();

        match self.log.append(txn).await {
            Ok(()) => {}
            Err(e @ GcError::DuplicateTransaction { .. }) => {
                self.halt(&e);
                // Whatever the log already holds stays drainable by replicas.
                match self.log.issued_txn_id(container_id).await {
                    Ok(issued) => g.issued = g.issued.max(issued),
                    Err(err) => tracing::warn!(container_id, error = %err, "issued id reload failed"),
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        g.issued = txn_id;
        tracing::info!(container_id, txn_id, blocks = block_count, "delete transaction issued");
        Ok(txn_id)
    }

    async fn compact(&self, container_id: ContainerId, state: &mut ContainerState, floor: TxnId) {
        if !self.config.compact_log || floor <= state.compacted_through {
            return;
        }
        match self.log.truncate_before(container_id, floor + 1).await {
            Ok(()) => {
                state.compacted_through = floor;
                tracing::debug!(container_id, through = floor, "delete log compacted");
            }
            Err(e) => {
                tracing::warn!(container_id, error = %e, "delete log compaction failed");
            }
        }
    }
}

impl<L: DeleteTransactionLog, P: ReplicaPlacement> BlockCoordinator for ClusterBlockCoordinator<L, P> {
    async fn schedule_deletion(
        &self,
        blocks: Vec<BlockId>,
    ) -> Result<BTreeMap<ContainerId, TxnId>, GcError> {
        if let Some(reason) = self.halted.get() {
            return Err(GcError::Halted(reason.clone()));
        }

        let mut grouped: BTreeMap<ContainerId, Vec<LocalId>> = BTreeMap::new();
        for block in blocks {
            grouped.entry(block.container_id).or_default().push(block.local_id);
        }
        // Reject the whole request before anything is appended.
        for &container_id in grouped.keys() {
            self.ensure_known(container_id)?;
        }

        let mut assigned = BTreeMap::new();
        for (container_id, local_ids) in grouped {
            let txn_id = self.append_next(container_id, local_ids).await?;
            assigned.insert(container_id, txn_id);
        }
        Ok(assigned)
    }

    async fn pending_transactions(
        &self,
        container_id: ContainerId,
        after_txn_id: TxnId,
    ) -> Result<Vec<DeleteTransaction>, GcError> {
        self.ensure_known(container_id)?;
        let state = self.state(container_id).await;
        // Held across the read so compaction cannot race past `after_txn_id`.
        let g = state.lock().await;
        if after_txn_id < g.compacted_through {
            return Err(GcError::LogCompacted {
                container_id,
                requested: after_txn_id,
                compacted_through: g.compacted_through,
            });
        }
        self.log.read_from(container_id, after_txn_id).await
    }

    async fn report_applied(
        &self,
        node_id: NodeId,
        container_id: ContainerId,
        applied_txn_id: TxnId,
    ) -> Result<ReportOutcome, GcError> {
        let replicas = self
            .placement
            .replicas_of(container_id)
            .ok_or(GcError::InvalidContainer(container_id))?;
        let state = self.state(container_id).await;
        let mut g = state.lock().await;

        if applied_txn_id > g.issued {
            return Err(GcError::InvalidArgument(format!(
                "node {node_id} reports {applied_txn_id} applied on container {container_id}, \
                 only {} issued",
                g.issued
            )));
        }
        let recorded = g.applied.get(&node_id).copied().unwrap_or(0);
        if applied_txn_id <= recorded {
            tracing::trace!(node_id, container_id, applied_txn_id, recorded, "stale report dropped");
            return Ok(ReportOutcome::Stale { recorded });
        }
        if !replicas.contains(&node_id) {
            tracing::warn!(node_id, container_id, "report from node outside the replica set");
        }

        self.log.save_progress(container_id, node_id, applied_txn_id).await?;
        g.applied.insert(node_id, applied_txn_id);
        tracing::debug!(node_id, container_id, applied_txn_id, "replica progress recorded");

        let floor = g.compaction_floor(&replicas);
        self.compact(container_id, &mut g, floor).await;

        Ok(ReportOutcome::Advanced { previous: recorded, current: applied_txn_id })
    }

    async fn container_info(&self, container_id: ContainerId) -> Result<ContainerInfo, GcError> {
        self.container_status(container_id).await.map(|s| ContainerInfo::from(&s))
    }
}
