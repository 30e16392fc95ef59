//! # Cluster Topology
//!
//! Membership view of the cluster: which nodes exist, where they listen,
//! how healthy they look, and when they were last seen. Each node keeps its
//! own view and folds in what gossip brings back; last-seen timestamps
//! decide which side of a merge is fresher.
//!
//! Health transitions are driven by the transport: the first failed request
//! degrades a node, `failure_threshold` consecutive failures make it
//! unreachable, and one success restores it.

use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// Cluster-unique node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Reachability classification of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Responding normally.
    Healthy,
    /// At least one recent failure; still queried.
    Degraded,
    /// Too many consecutive failures; requests fail fast.
    Unreachable,
    /// Administratively removed or given up on; excluded from the ring.
    Failed,
}

/// One member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Transport address, `host:port`.
    pub addr: String,
    pub status: NodeStatus,
    /// Wall-clock milliseconds of the last direct or gossiped sighting.
    pub last_seen_ms: u64,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        NodeInfo {
            id,
            addr: addr.into(),
            status: NodeStatus::Healthy,
            last_seen_ms: wall_clock_ms(),
        }
    }

    /// True when the node should be part of the hash ring.
    pub fn is_member(&self) -> bool {
        self.status != NodeStatus::Failed
    }

    /// True when requests to the node are worth attempting.
    pub fn is_reachable(&self) -> bool {
        matches!(self.status, NodeStatus::Healthy | NodeStatus::Degraded)
    }
}

pub(crate) fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// This node's view of cluster membership.
#[derive(Debug)]
pub struct ClusterTopology {
    local: NodeId,
    nodes: HashMap<NodeId, NodeInfo>,
    consecutive_failures: HashMap<NodeId, u32>,
    failure_threshold: u32,
}

impl ClusterTopology {
    /// Creates a view seeded with the local node and the configured seeds.
    pub fn new(local: NodeInfo, seeds: Vec<NodeInfo>, failure_threshold: u32) -> Self {
        let local_id = local.id;
        let mut nodes = HashMap::new();
        nodes.insert(local.id, local);
        for seed in seeds {
            if seed.id != local_id {
                nodes.insert(seed.id, seed);
            }
        }
        ClusterTopology {
            local: local_id,
            nodes,
            consecutive_failures: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All known nodes, unordered.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.values().cloned().collect()
    }

    /// Ids of every ring member, sorted for deterministic ring builds.
    pub fn member_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| node.is_member())
            .map(|node| node.id)
            .collect();
        ids.sort();
        ids
    }

    /// Adds or replaces a member. Returns true when ring membership changed.
    pub fn upsert(&mut self, node: NodeInfo) -> bool {
        let membership_changed = match self.nodes.get(&node.id) {
            Some(existing) => existing.is_member() != node.is_member(),
            None => node.is_member(),
        };
        self.nodes.insert(node.id, node);
        membership_changed
    }

    /// Removes a member outright. Returns true when it was present.
    pub fn remove(&mut self, id: NodeId) -> bool {
        self.consecutive_failures.remove(&id);
        self.nodes.remove(&id).is_some()
    }

    /// Folds a gossiped view into this one; fresher sightings win.
    ///
    /// Returns true when ring membership changed.
    pub fn merge(&mut self, remote: Vec<NodeInfo>) -> bool {
        let mut changed = false;
        for node in remote {
            if node.id == self.local {
                continue;
            }
            match self.nodes.get(&node.id) {
                Some(existing) if existing.last_seen_ms >= node.last_seen_ms => {}
                _ => changed |= self.upsert(node),
            }
        }
        changed
    }

    /// Records a successful exchange with a peer.
    pub fn record_success(&mut self, id: NodeId) {
        self.consecutive_failures.remove(&id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.status = NodeStatus::Healthy;
            node.last_seen_ms = wall_clock_ms();
        }
    }

    /// Records a failed exchange; returns the peer's new status.
    pub fn record_failure(&mut self, id: NodeId) -> NodeStatus {
        let failures = self.consecutive_failures.entry(id).or_insert(0);
        *failures += 1;
        let status = if *failures >= self.failure_threshold {
            NodeStatus::Unreachable
        } else {
            NodeStatus::Degraded
        };
        if let Some(node) = self.nodes.get_mut(&id) {
            node.status = status;
        }
        status
    }

    /// Stamps the local node as just seen; called before gossiping.
    pub fn touch_local(&mut self) {
        if let Some(node) = self.nodes.get_mut(&self.local) {
            node.last_seen_ms = wall_clock_ms();
            node.status = NodeStatus::Healthy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u64) -> NodeInfo {
        NodeInfo::new(NodeId(id), format!("127.0.0.1:{}", 7000 + id))
    }

    fn topology() -> ClusterTopology {
        ClusterTopology::new(info(1), vec![info(2), info(3)], 3)
    }

    #[test]
    fn seeds_are_members() {
        let topology = topology();
        assert!(!topology.is_empty());
        assert_eq!(topology.len(), 3);
        assert_eq!(topology.local_id(), NodeId(1));
        assert_eq!(
            topology.member_ids(),
            vec![NodeId(1), NodeId(2), NodeId(3)]
        );
    }

    #[test]
    fn removed_nodes_forget_their_failure_history() {
        let mut topology = topology();
        topology.record_failure(NodeId(2));
        topology.record_failure(NodeId(2));

        assert!(topology.remove(NodeId(2)));
        assert!(!topology.remove(NodeId(2)));
        assert_eq!(topology.len(), 2);

        // A re-added node starts with a clean slate.
        assert!(topology.upsert(info(2)));
        assert_eq!(topology.record_failure(NodeId(2)), NodeStatus::Degraded);
    }

    #[test]
    fn failures_degrade_then_cut_off() {
        let mut topology = topology();
        assert_eq!(topology.record_failure(NodeId(2)), NodeStatus::Degraded);
        assert_eq!(topology.record_failure(NodeId(2)), NodeStatus::Degraded);
        assert_eq!(topology.record_failure(NodeId(2)), NodeStatus::Unreachable);
        assert!(!topology.get(NodeId(2)).unwrap().is_reachable());

        topology.record_success(NodeId(2));
        assert_eq!(topology.get(NodeId(2)).unwrap().status, NodeStatus::Healthy);
        assert_eq!(topology.record_failure(NodeId(2)), NodeStatus::Degraded);
    }

    #[test]
    fn merge_prefers_fresher_sightings() {
        let mut topology = topology();
        let mut stale = info(2);
        stale.status = NodeStatus::Failed;
        stale.last_seen_ms = 0;
        assert!(!topology.merge(vec![stale]));
        assert!(topology.get(NodeId(2)).unwrap().is_member());

        let mut fresh = info(4);
        fresh.last_seen_ms = wall_clock_ms() + 1_000;
        assert!(topology.merge(vec![fresh]));
        assert_eq!(topology.len(), 4);
    }

    #[test]
    fn merge_never_overwrites_the_local_node() {
        let mut topology = topology();
        let mut imposter = info(1);
        imposter.status = NodeStatus::Failed;
        imposter.last_seen_ms = u64::MAX;
        assert!(!topology.merge(vec![imposter]));
        assert!(topology.get(NodeId(1)).unwrap().is_member());
    }

    #[test]
    fn failed_nodes_leave_the_ring_membership() {
        let mut topology = topology();
        let mut failed = info(3);
        failed.status = NodeStatus::Failed;
        failed.last_seen_ms = wall_clock_ms() + 1_000;
        assert!(topology.merge(vec![failed]));
        assert_eq!(topology.member_ids(), vec![NodeId(1), NodeId(2)]);
    }
}
