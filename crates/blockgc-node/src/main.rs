use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use blockgc_coordinator::{
    ClusterBlockCoordinator, CoordinatorConfig, KeyMetadataService, ReplicaPlacement, StaticPlacement,
};
use blockgc_storage::fjall::{FjallContainerStore, FjallStore, FjallTransactionLog};
use blockgc_storage::ContainerStore;
use blockgc_types::{BlockId, ContainerId, ContainerStatus, LocalId, NodeId};
use blockgc_worker::{BlockDeletionWorker, WorkerConfig};

type Coordinator = ClusterBlockCoordinator<FjallTransactionLog, Arc<StaticPlacement>>;
type Worker = BlockDeletionWorker<Coordinator, FjallContainerStore>;

#[derive(clap::Parser, Debug)]
#[command(name = "blockgc-node", about = "Block deletion pipeline over a simulated cluster")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `storage.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Overrides `cluster.nodes`.
    #[arg(long)]
    nodes: Option<u64>,
    /// Overrides `cluster.containers`.
    #[arg(long)]
    containers: Option<u64>,
    /// Overrides `cluster.demo_keys`.
    #[arg(long)]
    keys: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct WorkerSection {
    interval_ms: u64,
    max_transactions_per_container: usize,
    failure_threshold: u32,
    tombstone_retention_ms: u64,
}

impl From<&WorkerSection> for WorkerConfig {
    fn from(w: &WorkerSection) -> Self {
        WorkerConfig {
            interval: Duration::from_millis(w.interval_ms),
            max_transactions_per_container: w.max_transactions_per_container,
            failure_threshold: w.failure_threshold,
            tombstone_retention: Duration::from_millis(w.tombstone_retention_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClusterConfig {
    nodes: u64,
    containers: u64,
    replication_factor: u64,
    demo_keys: usize,
    blocks_per_key: usize,
    convergence_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    worker: WorkerSection,
    coordinator: CoordinatorConfig,
    cluster: ClusterConfig,
    observability: ObservabilityConfig,
}

impl Config {
    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(ref dir) = cli.data_dir {
            self.storage.data_dir = dir.clone();
        }
        if let Some(n) = cli.nodes {
            self.cluster.nodes = n;
        }
        if let Some(c) = cli.containers {
            self.cluster.containers = c;
        }
        if let Some(k) = cli.keys {
            self.cluster.demo_keys = k;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        let c = &self.cluster;
        anyhow::ensure!(c.nodes > 0, "cluster.nodes must be at least 1");
        anyhow::ensure!(c.containers > 0, "cluster.containers must be at least 1");
        anyhow::ensure!(
            (1..=c.nodes).contains(&c.replication_factor),
            "cluster.replication_factor must be between 1 and cluster.nodes ({})",
            c.nodes
        );
        anyhow::ensure!(self.worker.interval_ms > 0, "worker.interval_ms must be positive");
        anyhow::ensure!(self.worker.failure_threshold > 0, "worker.failure_threshold must be positive");
        Ok(())
    }
}

/// Replicas of container `c` are `replication_factor` consecutive node ids
/// starting at a rotating offset, so load spreads evenly.
fn replica_layout(cluster: &ClusterConfig) -> BTreeMap<ContainerId, Vec<NodeId>> {
    (1..=cluster.containers)
        .map(|c| {
            let replicas = (0..cluster.replication_factor)
                .map(|i| (c - 1 + i) % cluster.nodes + 1)
                .collect();
            (c, replicas)
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("BLOCKGC_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.apply_cli(&cli);
    config.validate()?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let data_dir = &config.storage.data_dir;
    tracing::info!(
        data_dir = %data_dir.display(),
        nodes = config.cluster.nodes,
        containers = config.cluster.containers,
        replication_factor = config.cluster.replication_factor,
        "blockgc starting"
    );

    // ---------------------------------------------------------------------
    // Placement, coordinator, metadata
    // ---------------------------------------------------------------------

    let placement = Arc::new(StaticPlacement::new());
    for (container_id, replicas) in replica_layout(&config.cluster) {
        placement.assign(container_id, replicas);
    }

    let coordinator_dir = data_dir.join("coordinator");
    let coordinator_store = FjallStore::open(&coordinator_dir)
        .with_context(|| format!("failed to open coordinator store at {}", coordinator_dir.display()))?;
    let coordinator = Arc::new(
        ClusterBlockCoordinator::open(
            FjallTransactionLog::new(coordinator_store),
            placement.clone(),
            config.coordinator.clone(),
        )
        .await
        .context("failed to load delete transaction log")?,
    );
    let metadata = KeyMetadataService::new(coordinator.clone());

    // ---------------------------------------------------------------------
    // Datanodes
    // ---------------------------------------------------------------------

    let worker_config = WorkerConfig::from(&config.worker);
    let token = CancellationToken::new();
    let mut workers: BTreeMap<NodeId, Arc<Worker>> = BTreeMap::new();
    let mut handles = Vec::new();
    for node_id in 1..=config.cluster.nodes {
        let node_dir = data_dir.join(format!("node-{node_id}"));
        let store = FjallStore::open(&node_dir)
            .with_context(|| format!("failed to open datanode store at {}", node_dir.display()))?;
        let worker = Arc::new(BlockDeletionWorker::new(node_id, coordinator.clone(), worker_config.clone()));
        for container_id in placement.hosted_by(node_id) {
            worker.add_container(Arc::new(FjallContainerStore::new(store.clone(), container_id)));
        }
        handles.push(tokio::spawn(worker.clone().run(token.clone())));
        workers.insert(node_id, worker);
    }

    // ---------------------------------------------------------------------
    // Demo workload: write keys, then delete them all
    // ---------------------------------------------------------------------

    // Local ids are unique per run so repeated runs against one data dir do
    // not collide with earlier tombstones.
    let run_base: LocalId = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
        << 16;
    let mut next_local: BTreeMap<ContainerId, LocalId> = BTreeMap::new();
    let mut keys = Vec::with_capacity(config.cluster.demo_keys);

    for k in 0..config.cluster.demo_keys {
        let key = format!("demo/key-{k}");
        let mut blocks = Vec::with_capacity(config.cluster.blocks_per_key);
        for b in 0..config.cluster.blocks_per_key {
            let container_id = ((k + b) as u64 % config.cluster.containers) + 1;
            let counter = next_local.entry(container_id).or_insert(0);
            *counter += 1;
            let block = BlockId::new(container_id, run_base + *counter);
            let replicas = placement.replicas_of(container_id).unwrap_or_default();
            for node_id in replicas {
                let store = workers
                    .get(&node_id)
                    .and_then(|w| w.store(container_id))
                    .with_context(|| format!("node {node_id} does not host container {container_id}"))?;
                store
                    .write_block(block.local_id, format!("{key}#{b}").into_bytes())
                    .await
                    .with_context(|| format!("failed to write block {block} on node {node_id}"))?;
            }
            blocks.push(block);
        }
        metadata.put_key(&key, blocks).await;
        keys.push(key);
    }
    tracing::info!(keys = keys.len(), "demo keys written");

    for key in &keys {
        metadata
            .delete_key(key)
            .await
            .with_context(|| format!("failed to delete key {key}"))?;
    }
    tracing::info!(keys = keys.len(), "demo keys deleted; waiting for datanodes");

    // ---------------------------------------------------------------------
    // Wait for every replica to catch up, then shut down
    // ---------------------------------------------------------------------

    let timeout = Duration::from_millis(config.cluster.convergence_timeout_ms);
    let converged = tokio::select! {
        r = tokio::time::timeout(timeout, wait_for_convergence(&coordinator)) => r.is_ok(),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            false
        }
    };

    for status in coordinator.list_containers().await.context("failed to read container status")? {
        tracing::info!(
            container_id = status.container_id,
            issued = status.issued_txn_id,
            min_applied = status.min_applied_across_replicas,
            applied_by_replica = ?status.applied_by_replica,
            "container status"
        );
    }
    for (node_id, worker) in &workers {
        let flagged = worker.flagged_containers();
        if !flagged.is_empty() {
            tracing::warn!(node_id, ?flagged, "containers with repeated purge failures");
        }
    }

    token.cancel();
    for handle in handles {
        handle.await.context("worker task panicked")?;
    }

    anyhow::ensure!(converged, "replicas did not converge within {timeout:?}");
    tracing::info!("all deletions applied on every replica");
    Ok(())
}

fn is_converged(status: &ContainerStatus) -> bool {
    status.min_applied_across_replicas == status.issued_txn_id
}

async fn wait_for_convergence(coordinator: &Coordinator) {
    loop {
        match coordinator.list_containers().await {
            Ok(statuses) if statuses.iter().all(is_converged) => return,
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "status poll failed"),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
