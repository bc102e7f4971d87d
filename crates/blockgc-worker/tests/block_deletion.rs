use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use blockgc_coordinator::{
    BlockCoordinator, ClusterBlockCoordinator, CoordinatorConfig, KeyMetadataService, ReplicaPlacement,
    StaticPlacement,
};
use blockgc_storage::fjall::{FjallContainerStore, FjallStore, FjallTransactionLog};
use blockgc_storage::{ContainerStore, DeleteTransactionLog};
use blockgc_types::{ApplyOutcome, BlockId, BlockState, ContainerId, DeleteTransaction, NodeId, TxnId};
use blockgc_worker::{BlockDeletionWorker, WorkerConfig};
use tokio_util::sync::CancellationToken;

type Coord = ClusterBlockCoordinator<FjallTransactionLog, Arc<StaticPlacement>>;
type Worker = BlockDeletionWorker<Coord, FjallContainerStore>;

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        interval: Duration::from_millis(100),
        max_transactions_per_container: 64,
        failure_threshold: 3,
        tombstone_retention: Duration::from_secs(600),
    }
}

struct Cluster {
    dir: tempfile::TempDir,
    placement: Arc<StaticPlacement>,
    coordinator_store: Arc<FjallStore>,
    coordinator: Arc<Coord>,
    stores: BTreeMap<NodeId, Arc<FjallStore>>,
    workers: BTreeMap<NodeId, Arc<Worker>>,
}

impl Cluster {
    async fn start(layout: &[(ContainerId, &[NodeId])]) -> Cluster {
        let dir = tempfile::tempdir().unwrap();
        let placement = Arc::new(StaticPlacement::new());
        for (c, nodes) in layout {
            placement.assign(*c, nodes.iter().copied());
        }
        let coordinator_store = FjallStore::open(&dir.path().join("coordinator")).unwrap();
        let coordinator = open_coordinator(&coordinator_store, placement.clone()).await;
        let mut cluster = Cluster {
            dir,
            placement,
            coordinator_store,
            coordinator,
            stores: BTreeMap::new(),
            workers: BTreeMap::new(),
        };
        let node_ids: Vec<NodeId> = layout.iter().flat_map(|(_, n)| n.iter().copied()).collect();
        for node_id in node_ids {
            if !cluster.workers.contains_key(&node_id) {
                cluster.start_node(node_id);
            }
        }
        cluster
    }

    /// Give a datanode a fresh worker and fresh container handles over its
    /// database. Everything the old worker held in memory is gone.
    fn start_node(&mut self, node_id: NodeId) {
        let dir = self.dir.path().join(format!("node-{node_id}"));
        let store = self.stores.entry(node_id).or_insert_with(|| FjallStore::open(&dir).unwrap()).clone();
        let worker = Arc::new(BlockDeletionWorker::new(node_id, self.coordinator.clone(), worker_config()));
        for container_id in self.placement.hosted_by(node_id) {
            worker.add_container(Arc::new(FjallContainerStore::new(store.clone(), container_id)));
        }
        self.workers.insert(node_id, worker);
    }

    /// Rebuild the coordinator from its durable log and restart every worker
    /// against the new instance.
    async fn restart_coordinator(&mut self) {
        self.workers.clear();
        self.coordinator = open_coordinator(&self.coordinator_store, self.placement.clone()).await;
        let node_ids: Vec<NodeId> = self.stores.keys().copied().collect();
        for node_id in node_ids {
            self.start_node(node_id);
        }
    }

    fn container(&self, node_id: NodeId, container_id: ContainerId) -> Arc<FjallContainerStore> {
        self.workers[&node_id].store(container_id).unwrap()
    }

    fn replicas(&self, container_id: ContainerId) -> Vec<NodeId> {
        self.placement.replicas_of(container_id).map(|r| r.into_iter().collect()).unwrap_or_default()
    }

    /// Write a block to every replica of its container.
    async fn write_block(&self, block: BlockId) {
        for node_id in self.replicas(block.container_id) {
            self.container(node_id, block.container_id)
                .write_block(block.local_id, format!("data-{block}").into_bytes())
                .await
                .unwrap();
        }
    }

    async fn run_all_workers(&self) {
        for worker in self.workers.values() {
            let report = worker.run_once().await;
            assert!(report.failed.is_empty(), "node {} failed: {:?}", worker.node_id(), report.failed);
        }
    }

    async fn assert_applied_within_issued(&self) {
        for (node_id, worker) in &self.workers {
            for container_id in worker.containers() {
                let applied = self.container(*node_id, container_id).applied_txn_id().await.unwrap();
                let issued = self.coordinator.log().issued_txn_id(container_id).await.unwrap();
                assert!(applied <= issued, "node {node_id} container {container_id}: {applied} > {issued}");
            }
        }
    }
}

async fn open_coordinator(store: &Arc<FjallStore>, placement: Arc<StaticPlacement>) -> Arc<Coord> {
    let log = FjallTransactionLog::new(store.clone());
    Arc::new(ClusterBlockCoordinator::open(log, placement, CoordinatorConfig::default()).await.unwrap())
}

#[tokio::test]
async fn key_delete_purges_blocks_on_every_container() {
    let cluster = Cluster::start(&[(1, &[10]), (2, &[10])]).await;
    let key_blocks = vec![BlockId::new(1, 1), BlockId::new(1, 2), BlockId::new(2, 1)];
    for b in &key_blocks {
        cluster.write_block(*b).await;
    }
    let metadata = KeyMetadataService::new(cluster.coordinator.clone());
    metadata.put_key("vol/bucket/key", key_blocks.clone()).await;

    // Nothing issued yet: both sides agree on 0.
    for c in [1, 2] {
        let info = cluster.coordinator.container_info(c).await.unwrap();
        assert_eq!((info.issued_txn_id, info.min_applied_across_replicas), (0, 0));
    }

    assert!(metadata.delete_key("vol/bucket/key").await.unwrap());
    let pending = cluster.coordinator.pending_transactions(1, 0).await.unwrap();
    assert_eq!((pending[0].txn_id, pending[0].blocks.clone()), (1, vec![1, 2]));
    assert_eq!(cluster.coordinator.pending_transactions(2, 0).await.unwrap()[0].blocks, vec![1]);

    cluster.run_all_workers().await;

    for b in &key_blocks {
        let store = cluster.container(10, b.container_id);
        assert_eq!(store.get(b.local_id).await.unwrap().unwrap().state, BlockState::Purged);
        assert!(store.read_block(b.local_id).await.unwrap().is_none());
    }
    for c in [1, 2] {
        let info = cluster.coordinator.container_info(c).await.unwrap();
        assert_eq!(info.min_applied_across_replicas, 1);
        // Datanode and coordinator agree on the container's delete watermark.
        let node_applied = cluster.container(10, c).applied_txn_id().await.unwrap();
        assert_eq!(node_applied, info.min_applied_across_replicas);
    }
    cluster.assert_applied_within_issued().await;
}

#[tokio::test]
async fn replicas_converge_and_min_tracks_slowest() {
    let mut cluster = Cluster::start(&[(1, &[10, 11, 12])]).await;
    for local in 1..=4 {
        cluster.write_block(BlockId::new(1, local)).await;
    }
    cluster.coordinator.schedule_deletion(vec![BlockId::new(1, 1), BlockId::new(1, 2)]).await.unwrap();
    cluster.coordinator.schedule_deletion(vec![BlockId::new(1, 3)]).await.unwrap();

    // Only two of three replicas run.
    cluster.workers[&10].run_once().await;
    cluster.workers[&11].run_once().await;
    let status = cluster.coordinator.container_status(1).await.unwrap();
    assert_eq!(status.applied_by_replica, BTreeMap::from([(10, 2), (11, 2), (12, 0)]));
    assert_eq!(status.min_applied_across_replicas, 0);

    // Node 12 restarts before it ever ran, then catches up.
    cluster.start_node(12);
    cluster.workers[&12].run_once().await;
    let status = cluster.coordinator.container_status(1).await.unwrap();
    assert_eq!(status.min_applied_across_replicas, 2);

    for node_id in [10, 11, 12] {
        let store = cluster.container(node_id, 1);
        for local in 1..=3 {
            assert_eq!(store.get(local).await.unwrap().unwrap().state, BlockState::Purged);
        }
        assert_eq!(store.get(4).await.unwrap().unwrap().state, BlockState::Present);
    }
    cluster.assert_applied_within_issued().await;
}

#[tokio::test]
async fn crash_mid_apply_redrives_to_same_state() {
    let mut cluster = Cluster::start(&[(1, &[10]), (2, &[20])]).await;
    for (c, local) in [(1, 1), (1, 2), (2, 1), (2, 2)] {
        cluster.write_block(BlockId::new(c, local)).await;
    }
    cluster.coordinator.schedule_deletion(vec![BlockId::new(1, 1), BlockId::new(1, 2)]).await.unwrap();
    cluster.coordinator.schedule_deletion(vec![BlockId::new(2, 1), BlockId::new(2, 2)]).await.unwrap();

    // Node 10 purges block 1 of the transaction, then dies before the
    // watermark moves.
    let crashed = cluster.container(10, 1);
    crashed.mark_purged(1).await.unwrap();
    assert_eq!(crashed.applied_txn_id().await.unwrap(), 0);
    drop(crashed);
    cluster.start_node(10);

    cluster.run_all_workers().await;

    let recovered = cluster.container(10, 1).summary().await.unwrap();
    let uninterrupted = cluster.container(20, 2).summary().await.unwrap();
    assert_eq!(recovered, uninterrupted);
    assert_eq!(recovered.applied_txn_id, 1);
    assert_eq!(recovered.purged, 2);
}

#[tokio::test]
async fn reapplying_a_transaction_is_a_no_op() {
    let cluster = Cluster::start(&[(1, &[10])]).await;
    for local in 1..=3 {
        cluster.write_block(BlockId::new(1, local)).await;
    }
    cluster.coordinator.schedule_deletion(vec![BlockId::new(1, 1), BlockId::new(1, 3)]).await.unwrap();
    cluster.run_all_workers().await;

    let store = cluster.container(10, 1);
    let once = store.summary().await.unwrap();
    let states_once = block_states(&store).await;

    // Redelivery of a transaction the node already applied.
    let redelivered = DeleteTransaction::new(1, 1, vec![1, 3]);
    assert_eq!(store.apply_transaction(&redelivered).await.unwrap(), ApplyOutcome::AlreadyApplied);
    cluster.run_all_workers().await;

    assert_eq!(store.summary().await.unwrap(), once);
    assert_eq!(block_states(&store).await, states_once);
    assert_eq!(block_states(&store).await[1], Some(BlockState::Present));
}

async fn block_states(store: &FjallContainerStore) -> Vec<Option<BlockState>> {
    let mut out = Vec::new();
    for local in 1..=3 {
        out.push(store.get(local).await.unwrap().map(|r| r.state));
    }
    out
}

#[tokio::test]
async fn transaction_ids_are_gap_free_from_one() {
    let cluster = Cluster::start(&[(1, &[10]), (2, &[10])]).await;
    let cfg = CoordinatorConfig { compact_log: false };
    let coordinator = Arc::new(
        ClusterBlockCoordinator::open(
            FjallTransactionLog::new(FjallStore::open(&cluster.dir.path().join("uncompacted")).unwrap()),
            cluster.placement.clone(),
            cfg,
        )
        .await
        .unwrap(),
    );

    let mut tasks = Vec::new();
    for n in 0..40u64 {
        let coordinator = coordinator.clone();
        tasks.push(tokio::spawn(async move {
            let blocks = vec![BlockId::new(1, n), BlockId::new(1 + n % 2, 100 + n)];
            coordinator.schedule_deletion(blocks).await.unwrap()
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    for c in [1u64, 2] {
        let ids: Vec<TxnId> = coordinator.log().read_from(c, 0).await.unwrap().iter().map(|t| t.txn_id).collect();
        let expected: Vec<TxnId> = (1..=ids.len() as u64).collect();
        assert_eq!(ids, expected, "container {c}");
    }
    assert_eq!(coordinator.log().issued_txn_id(1).await.unwrap(), 40);
    assert_eq!(coordinator.log().issued_txn_id(2).await.unwrap(), 20);
}

#[tokio::test]
async fn coordinator_restart_relearns_progress_from_reports() {
    let mut cluster = Cluster::start(&[(1, &[10, 11])]).await;
    for local in 1..=2 {
        cluster.write_block(BlockId::new(1, local)).await;
    }
    cluster.coordinator.schedule_deletion(vec![BlockId::new(1, 1)]).await.unwrap();
    cluster.run_all_workers().await;
    cluster.coordinator.schedule_deletion(vec![BlockId::new(1, 2)]).await.unwrap();

    cluster.restart_coordinator().await;
    let info = cluster.coordinator.container_info(1).await.unwrap();
    assert_eq!((info.issued_txn_id, info.min_applied_across_replicas), (2, 1));

    cluster.run_all_workers().await;
    let info = cluster.coordinator.container_info(1).await.unwrap();
    assert_eq!(info.min_applied_across_replicas, 2);
    // Every replica applied everything, so the log is compacted away.
    let state = cluster.coordinator.log().log_state(1).await.unwrap();
    assert_eq!((state.first_txn_id, state.issued_txn_id), (None, 2));
    cluster.assert_applied_within_issued().await;
}

#[tokio::test]
async fn replica_briefly_out_of_placement_still_catches_up() {
    let mut cluster = Cluster::start(&[(1, &[10, 11])]).await;
    for local in 1..=3 {
        cluster.write_block(BlockId::new(1, local)).await;
    }
    cluster.coordinator.schedule_deletion(vec![BlockId::new(1, 1)]).await.unwrap();
    cluster.run_all_workers().await;
    cluster.coordinator.schedule_deletion(vec![BlockId::new(1, 2)]).await.unwrap();
    cluster.coordinator.schedule_deletion(vec![BlockId::new(1, 3)]).await.unwrap();

    // Node 11 drops out of placement while node 10 applies everything.
    cluster.placement.remove_replica(1, 11);
    cluster.workers[&10].run_once().await;
    assert_eq!(cluster.coordinator.container_info(1).await.unwrap().min_applied_across_replicas, 3);
    assert_eq!(cluster.coordinator.log().log_state(1).await.unwrap().first_txn_id, Some(2));

    cluster.placement.assign(1, [10, 11]);
    let report = cluster.workers[&11].run_once().await;
    assert!(report.failed.is_empty());
    assert_eq!(report.completed[0].to, 3);

    let store = cluster.container(11, 1);
    for local in 1..=3 {
        assert_eq!(store.get(local).await.unwrap().unwrap().state, BlockState::Purged);
    }
    let info = cluster.coordinator.container_info(1).await.unwrap();
    assert_eq!((info.issued_txn_id, info.min_applied_across_replicas), (3, 3));
    assert_eq!(cluster.coordinator.log().log_state(1).await.unwrap().first_txn_id, None);

    // A replica that joins after compaction cannot be served from the log; it
    // fails every pass and gets flagged instead of silently idling.
    cluster.placement.assign(1, [10, 11, 12]);
    cluster.start_node(12);
    for _ in 0..worker_config().failure_threshold {
        assert_eq!(cluster.workers[&12].run_once().await.failed, vec![1]);
    }
    let worker = &cluster.workers[&12];
    assert_eq!(worker.flagged_containers(), vec![1]);
    let health = worker.health();
    assert!(health[0].last_error.as_deref().unwrap_or_default().contains("compacted through 3"));
    assert_eq!(cluster.container(12, 1).applied_txn_id().await.unwrap(), 0);
    cluster.assert_applied_within_issued().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn background_workers_purge_within_an_interval() {
    let cluster = Cluster::start(&[(1, &[10, 11]), (2, &[11])]).await;
    let blocks: Vec<BlockId> = (1..=5).map(|l| BlockId::new(1, l)).chain((1..=3).map(|l| BlockId::new(2, l))).collect();
    for b in &blocks {
        cluster.write_block(*b).await;
    }

    let token = CancellationToken::new();
    let handles: Vec<_> = cluster
        .workers
        .values()
        .map(|w| tokio::spawn(w.clone().run(token.clone())))
        .collect();

    cluster.coordinator.on_key_deleted(blocks.clone()).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let converged = cluster.coordinator.container_info(1).await.unwrap().min_applied_across_replicas == 1
            && cluster.coordinator.container_info(2).await.unwrap().min_applied_across_replicas == 1;
        if converged {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "replicas did not converge");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    token.cancel();
    for h in handles {
        h.await.unwrap();
    }
    for b in &blocks {
        for node_id in cluster.replicas(b.container_id) {
            let record = cluster.container(node_id, b.container_id).get(b.local_id).await.unwrap();
            assert_eq!(record.map(|r| r.state), Some(BlockState::Purged), "block {b} on node {node_id}");
        }
    }
    cluster.assert_applied_within_issued().await;
}
