use blockgc_types::{ContainerId, LocalId, NodeId, TxnId};

/// `delete_log` partition: `container(8) ++ txn_id(8)`, fixed 16 bytes.
/// Big-endian on both components so lexicographic order = numeric order.
pub fn delete_log_key(container_id: ContainerId, txn_id: TxnId) -> [u8; 16] {
    pair_key(container_id, txn_id)
}

/// `blocks` and `chunks` partitions: `container(8) ++ local_id(8)`.
pub fn block_key(container_id: ContainerId, local_id: LocalId) -> [u8; 16] {
    pair_key(container_id, local_id)
}

/// `progress` partition: `container(8) ++ node_id(8)`.
pub fn progress_key(container_id: ContainerId, node_id: NodeId) -> [u8; 16] {
    pair_key(container_id, node_id)
}

/// 8-byte prefix shared by every key belonging to a container.
pub fn container_prefix(container_id: ContainerId) -> [u8; 8] {
    container_id.to_be_bytes()
}

/// `meta` partition: `container(8) ++ label_utf8`
pub fn meta_key(container_id: ContainerId, label: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + label.len());
    buf.extend_from_slice(&container_id.to_be_bytes());
    buf.extend_from_slice(label.as_bytes());
    buf
}

/// Split a 16-byte pair key back into its two components.
pub fn split_pair_key(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() != 16 {
        return None;
    }
    let hi = u64::from_be_bytes(key[..8].try_into().ok()?);
    let lo = u64::from_be_bytes(key[8..16].try_into().ok()?);
    Some((hi, lo))
}

fn pair_key(hi: u64, lo: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&hi.to_be_bytes());
    key[8..].copy_from_slice(&lo.to_be_bytes());
    key
}
