use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use blockgc_types::{ContainerId, NodeId};

/// Which nodes are expected to hold a replica of each container.
///
/// Supplied by cluster membership and assumed eventually consistent. `None`
/// from `replicas_of` means the container is unknown.
pub trait ReplicaPlacement: Send + Sync + 'static {
    fn replicas_of(&self, container_id: ContainerId) -> Option<BTreeSet<NodeId>>;

    fn containers(&self) -> Vec<ContainerId>;
}

impl<P: ReplicaPlacement> ReplicaPlacement for Arc<P> {
    fn replicas_of(&self, container_id: ContainerId) -> Option<BTreeSet<NodeId>> {
        (**self).replicas_of(container_id)
    }

    fn containers(&self) -> Vec<ContainerId> {
        (**self).containers()
    }
}

/// In-process placement table.
#[derive(Default)]
pub struct StaticPlacement {
    inner: RwLock<BTreeMap<ContainerId, BTreeSet<NodeId>>>,
}

impl StaticPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the replica set of `container_id`, registering it if new.
    pub fn assign(&self, container_id: ContainerId, nodes: impl IntoIterator<Item = NodeId>) {
        if let Ok(mut g) = self.inner.write() {
            g.insert(container_id, nodes.into_iter().collect());
        }
    }

    pub fn remove_replica(&self, container_id: ContainerId, node_id: NodeId) {
        if let Ok(mut g) = self.inner.write() {
            if let Some(nodes) = g.get_mut(&container_id) {
                nodes.remove(&node_id);
            }
        }
    }

    /// Containers `node_id` is expected to host.
    pub fn hosted_by(&self, node_id: NodeId) -> Vec<ContainerId> {
        self.inner
            .read()
            .map(|g| {
                g.iter()
                    .filter(|(_, nodes)| nodes.contains(&node_id))
                    .map(|(&c, _)| c)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ReplicaPlacement for StaticPlacement {
    fn replicas_of(&self, container_id: ContainerId) -> Option<BTreeSet<NodeId>> {
        self.inner.read().ok()?.get(&container_id).cloned()
    }

    fn containers(&self) -> Vec<ContainerId> {
        self.inner.read().map(|g| g.keys().copied().collect()).unwrap_or_default()
    }
}
