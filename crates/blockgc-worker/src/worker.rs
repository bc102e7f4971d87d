use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use blockgc_coordinator::BlockCoordinator;
use blockgc_storage::ContainerStore;
use blockgc_types::{now_ns, ApplyOutcome, ContainerId, GcError, LocalId, NodeId, TxnId};

use crate::config::WorkerConfig;

/// Tombstones modified before the returned timestamp are old enough to drop.
/// Retentions beyond the `i64` range never expire anything.
fn retention_cutoff(now: i64, retention: Duration) -> i64 {
    now.saturating_sub(i64::try_from(retention.as_nanos()).unwrap_or(i64::MAX))
}

/// What one reconciliation of one container achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerPass {
    pub container_id: ContainerId,
    /// Applied watermark before the pass.
    pub from: TxnId,
    /// Applied watermark after the pass.
    pub to: TxnId,
    pub reclaimed_tombstones: usize,
}

/// Summary of one `run_once` call across every hosted container.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub completed: Vec<ContainerPass>,
    pub failed: Vec<ContainerId>,
    /// Still running from an earlier pass; not started again.
    pub skipped: Vec<ContainerId>,
    /// Started this pass but not finished within the interval. They keep
    /// running in the background.
    pub unfinished: Vec<ContainerId>,
}

impl PassReport {
    pub fn applied_txns(&self) -> u64 {
        self.completed.iter().map(|p| p.to - p.from).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHealth {
    pub container_id: ContainerId,
    pub consecutive_failures: u32,
    /// Set once `consecutive_failures` reaches the configured threshold.
    pub flagged: bool,
    pub last_error: Option<String>,
}

struct ContainerSlot<S> {
    store: Arc<S>,
    running: AtomicBool,
    consecutive_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
}

/// Clears a slot's `running` flag when the reconciliation task ends, panics
/// included.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-node background task that drains delete transactions from the
/// coordinator into the node's container stores.
///
/// Each container is reconciled in its own spawned task so a slow or failing
/// container never holds up the rest.
pub struct BlockDeletionWorker<C, S> {
    node_id: NodeId,
    coordinator: Arc<C>,
    config: WorkerConfig,
    slots: RwLock<BTreeMap<ContainerId, Arc<ContainerSlot<S>>>>,
}

impl<C: BlockCoordinator, S: ContainerStore> BlockDeletionWorker<C, S> {
    pub fn new(node_id: NodeId, coordinator: Arc<C>, config: WorkerConfig) -> Self {
        BlockDeletionWorker { node_id, coordinator, config, slots: RwLock::new(BTreeMap::new()) }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Start reconciling a container replica hosted on this node.
    pub fn add_container(&self, store: Arc<S>) {
        let container_id = store.container_id();
        if let Ok(mut g) = self.slots.write() {
            g.entry(container_id).or_insert_with(|| {
                Arc::new(ContainerSlot {
                    store,
                    running: AtomicBool::new(false),
                    consecutive_failures: AtomicU32::new(0),
                    last_error: Mutex::new(None),
                })
            });
        }
    }

    pub fn remove_container(&self, container_id: ContainerId) -> Option<Arc<S>> {
        self.slots.write().ok()?.remove(&container_id).map(|s| s.store.clone())
    }

    pub fn store(&self, container_id: ContainerId) -> Option<Arc<S>> {
        self.slots.read().ok()?.get(&container_id).map(|s| s.store.clone())
    }

    pub fn containers(&self) -> Vec<ContainerId> {
        self.slots.read().map(|g| g.keys().copied().collect()).unwrap_or_default()
    }

    pub fn health(&self) -> Vec<ContainerHealth> {
        let threshold = self.config.failure_threshold;
        self.slot_snapshot()
            .into_iter()
            .map(|(container_id, slot)| {
                let consecutive_failures = slot.consecutive_failures.load(Ordering::Acquire);
                ContainerHealth {
                    container_id,
                    consecutive_failures,
                    flagged: consecutive_failures >= threshold,
                    last_error: slot.last_error.lock().ok().and_then(|e| e.clone()),
                }
            })
            .collect()
    }

    pub fn flagged_containers(&self) -> Vec<ContainerId> {
        self.health().into_iter().filter(|h| h.flagged).map(|h| h.container_id).collect()
    }

    fn slot_snapshot(&self) -> Vec<(ContainerId, Arc<ContainerSlot<S>>)> {
        self.slots
            .read()
            .map(|g| g.iter().map(|(&c, s)| (c, s.clone())).collect())
            .unwrap_or_default()
    }

    /// Run one reconciliation pass over every hosted container.
    ///
    /// Waits at most one interval for the per-container tasks; anything
    /// slower is reported as unfinished and left to complete on its own.
    pub async fn run_once(self: &Arc<Self>) -> PassReport {
        let mut report = PassReport::default();
        let mut handles = Vec::new();

        for (container_id, slot) in self.slot_snapshot() {
            if slot.running.swap(true, Ordering::AcqRel) {
                report.skipped.push(container_id);
                continue;
            }
            let worker = self.clone();
            let handle = tokio::spawn(async move {
                let _running = RunningGuard(&slot.running);
                let result = worker.reconcile(&slot.store).await;
                worker.record_result(container_id, &slot, &result);
                result
            });
            handles.push((container_id, handle));
        }

        let deadline = Instant::now() + self.config.interval;
        for (container_id, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(pass))) => report.completed.push(pass),
                Ok(Ok(Err(_))) => report.failed.push(container_id),
                Ok(Err(join_err)) => {
                    tracing::error!(node_id = self.node_id, container_id, error = %join_err, "reconcile task panicked");
                    report.failed.push(container_id);
                }
                // Dropping the handle detaches the task; it finishes in the background.
                Err(_) => report.unfinished.push(container_id),
            }
        }
        report
    }

    /// Run passes every `interval` until `token` is cancelled.
    ///
    /// On cancellation no new pass starts; in-flight container tasks get up
    /// to one interval to finish. Each transaction is applied as one atomic
    /// unit, so a task cut short leaves the watermark consistent.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(node_id = self.node_id, interval = ?self.config.interval, "block deletion worker started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.run_once().await;
            if !report.failed.is_empty() || !report.unfinished.is_empty() {
                tracing::debug!(
                    node_id = self.node_id,
                    failed = ?report.failed,
                    unfinished = ?report.unfinished,
                    "reconciliation pass incomplete"
                );
            }
        }

        self.wait_idle(self.config.interval).await;
        tracing::info!(node_id = self.node_id, "block deletion worker stopped");
    }

    async fn wait_idle(&self, limit: Duration) {
        let deadline = Instant::now() + limit;
        while self.slot_snapshot().iter().any(|(_, s)| s.running.load(Ordering::Acquire)) {
            if Instant::now() >= deadline {
                tracing::warn!(node_id = self.node_id, "shutting down with reconciliation in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Bring one container up to date with the coordinator.
    ///
    /// The store's watermark only moves through `apply_transaction`, which
    /// purges a transaction's blocks and advances the watermark atomically, so
    /// an error at any point leaves a state that the next pass re-drives.
    async fn reconcile(&self, store: &S) -> Result<ContainerPass, GcError> {
        let container_id = store.container_id();
        let from = store.applied_txn_id().await?;
        let mut pending = self.coordinator.pending_transactions(container_id, from).await?;
        pending.truncate(self.config.max_transactions_per_container);

        if !pending.is_empty() {
            let local_ids: Vec<LocalId> = pending.iter().flat_map(|t| t.blocks.iter().copied()).collect();
            store.mark_pending_delete(&local_ids).await?;
        }

        let mut applied = from;
        let mut outcome = Ok(());
        for txn in &pending {
            if txn.txn_id != applied + 1 {
                outcome = Err(GcError::InvalidArgument(format!(
                    "container {container_id}: expected transaction {} next, coordinator sent {}",
                    applied + 1,
                    txn.txn_id
                )));
                break;
            }
            match store.apply_transaction(txn).await {
                Ok(ApplyOutcome::Applied { purged }) => {
                    tracing::debug!(node_id = self.node_id, container_id, txn_id = txn.txn_id, purged, "transaction applied");
                    applied = txn.txn_id;
                }
                Ok(ApplyOutcome::AlreadyApplied) => applied = txn.txn_id,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        // Reported on every pass, not only on progress: a restarted
        // coordinator relearns the watermark this way.
        if applied > 0 {
            if let Err(e) = self.coordinator.report_applied(self.node_id, container_id, applied).await {
                tracing::warn!(node_id = self.node_id, container_id, applied, error = %e, "watermark report failed");
            }
        }
        outcome?;

        let cutoff = retention_cutoff(now_ns(), self.config.tombstone_retention);
        let reclaimed_tombstones = store.reclaim_tombstones(cutoff).await?;

        Ok(ContainerPass { container_id, from, to: applied, reclaimed_tombstones })
    }

    fn record_result(&self, container_id: ContainerId, slot: &ContainerSlot<S>, result: &Result<ContainerPass, GcError>) {
        match result {
            Ok(pass) => {
                let previous = slot.consecutive_failures.swap(0, Ordering::AcqRel);
                if previous >= self.config.failure_threshold {
                    tracing::info!(node_id = self.node_id, container_id, "container recovered");
                }
                if let Ok(mut e) = slot.last_error.lock() {
                    *e = None;
                }
                if pass.to > pass.from {
                    tracing::info!(node_id = self.node_id, container_id, from = pass.from, to = pass.to, "container watermark advanced");
                }
            }
            Err(err) => {
                let failures = slot.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if let Ok(mut e) = slot.last_error.lock() {
                    *e = Some(err.to_string());
                }
                if failures == self.config.failure_threshold {
                    tracing::warn!(node_id = self.node_id, container_id, failures, error = %err, "container flagged: purge keeps failing");
                } else {
                    tracing::debug!(node_id = self.node_id, container_id, failures, error = %err, "reconcile failed; retrying next pass");
                }
            }
        }
    }
}
