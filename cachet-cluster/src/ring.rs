//! # Consistent-Hash Ring
//!
//! Keys hash into a fixed partition space; partitions map onto nodes
//! through a ring of virtual node positions. The ring is a pure function
//! of the member set, the virtual-node count, and the partition count, so
//! every coordinator that agrees on membership routes identically.
//!
//! Hashing is a fixed FNV-1a, never a seeded hasher: two processes must
//! place the same key in the same partition.

use std::collections::BTreeMap;

use crate::topology::NodeId;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Deterministic FNV-1a over raw bytes.
pub(crate) fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Ring of virtual node positions over a fixed partition space.
#[derive(Debug, Clone)]
pub struct HashRing {
    partition_count: u32,
    positions: BTreeMap<u64, NodeId>,
}

impl HashRing {
    /// Builds the ring for `members` with `virtual_nodes` positions each.
    ///
    /// `members` order does not matter; the ring is identical for any
    /// permutation of the same set.
    pub fn build(members: &[NodeId], partition_count: u32, virtual_nodes: u32) -> Self {
        let mut positions = BTreeMap::new();
        for &node in members {
            for replica in 0..virtual_nodes {
                let mut token = [0u8; 12];
                token[..8].copy_from_slice(&node.0.to_be_bytes());
                token[8..].copy_from_slice(&replica.to_be_bytes());
                positions.insert(stable_hash(&token), node);
            }
        }
        HashRing {
            partition_count: partition_count.max(1),
            positions,
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Partition owning a key hash.
    pub fn partition_of(&self, key_hash: u64) -> u32 {
        (key_hash % self.partition_count as u64) as u32
    }

    /// Ordered replica list for a partition: the first `replication_factor`
    /// distinct nodes clockwise from the partition's ring point.
    pub fn replicas(&self, partition: u32, replication_factor: usize) -> Vec<NodeId> {
        if self.positions.is_empty() || replication_factor == 0 {
            return Vec::new();
        }

        let point = stable_hash(&partition.to_be_bytes());
        let mut replicas = Vec::with_capacity(replication_factor);
        for (_, &node) in self
            .positions
            .range(point..)
            .chain(self.positions.range(..point))
        {
            if !replicas.contains(&node) {
                replicas.push(node);
                if replicas.len() == replication_factor {
                    break;
                }
            }
        }
        replicas
    }

    /// Replica list for a key hash; see [`Self::replicas`].
    pub fn replicas_for_hash(&self, key_hash: u64, replication_factor: usize) -> Vec<NodeId> {
        self.replicas(self.partition_of(key_hash), replication_factor)
    }

    /// Partitions whose replica set of the given size includes `node`.
    pub fn partitions_of(&self, node: NodeId, replication_factor: usize) -> Vec<u32> {
        (0..self.partition_count)
            .filter(|&partition| self.replicas(partition, replication_factor).contains(&node))
            .collect()
    }
}
