//! # Cluster Configuration
//!
//! Options for the distributed overlay. A plain struct with defaults; the
//! node validates it once at start and rejects nonsense with a
//! configuration error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::topology::{NodeId, NodeInfo};

/// How many replica acknowledgements an operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Quorum writes and version-latest quorum reads.
    Strong,
    /// Local apply, asynchronous replication.
    Eventual,
    /// Eventual, plus read-your-writes inside a session handle.
    Session,
    /// Eventual, plus per-key monotonic reads at this node.
    MonotonicRead,
}

/// A peer known at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedNode {
    pub id: u64,
    /// Transport address, `host:port`.
    pub addr: String,
}

impl SeedNode {
    pub fn new(id: u64, addr: impl Into<String>) -> Self {
        SeedNode {
            id,
            addr: addr.into(),
        }
    }

    pub(crate) fn info(&self) -> NodeInfo {
        NodeInfo::new(NodeId(self.id), self.addr.clone())
    }
}

/// Options consumed by [`crate::DistributedCache`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Human-readable cluster name; must match across members.
    pub cluster_name: String,
    /// This node's cluster-unique id.
    pub node_id: u64,
    /// Address the transport listens on (the transport port).
    pub bind_addr: String,
    /// Peers contacted at startup.
    pub seeds: Vec<SeedNode>,
    /// Copies kept of every key, this node included.
    pub replication_factor: usize,
    /// Consistency level applied to every operation.
    pub consistency: ConsistencyLevel,
    /// Fixed number of hash-space slices.
    pub partition_count: u32,
    /// Ring positions per node.
    pub virtual_nodes: u32,
    /// Per-request network deadline.
    pub network_timeout: Duration,
    /// Repair stale replicas discovered by quorum reads.
    pub read_repair: bool,
    /// Cadence of the membership gossip task.
    pub gossip_interval: Duration,
    /// Connection attempts before a send is reported failed.
    pub max_reconnect_attempts: u32,
    /// Consecutive failures before a peer is marked unreachable.
    pub failure_threshold: u32,
    /// Compress frames on the wire (not supported by wire format v1).
    pub compression_enabled: bool,
    /// Encrypt frames on the wire (not supported by wire format v1).
    pub encryption_enabled: bool,
}

impl ClusterConfig {
    /// A config with defaults for everything but the identity fields.
    pub fn new(cluster_name: impl Into<String>, node_id: u64, bind_addr: impl Into<String>) -> Self {
        ClusterConfig {
            cluster_name: cluster_name.into(),
            node_id,
            bind_addr: bind_addr.into(),
            seeds: Vec::new(),
            replication_factor: 2,
            consistency: ConsistencyLevel::Eventual,
            partition_count: 256,
            virtual_nodes: 100,
            network_timeout: Duration::from_secs(5),
            read_repair: true,
            gossip_interval: Duration::from_secs(1),
            max_reconnect_attempts: 3,
            failure_threshold: 3,
            compression_enabled: false,
            encryption_enabled: false,
        }
    }

    pub(crate) fn validate(&self) -> ClusterResult<()> {
        if self.cluster_name.is_empty() {
            return Err(ClusterError::configuration("cluster_name must not be empty"));
        }
        if self.bind_addr.is_empty() {
            return Err(ClusterError::configuration("bind_addr must not be empty"));
        }
        if self.replication_factor == 0 {
            return Err(ClusterError::configuration(
                "replication_factor must be at least 1",
            ));
        }
        if self.partition_count == 0 {
            return Err(ClusterError::configuration(
                "partition_count must be at least 1",
            ));
        }
        if !(1..=1024).contains(&self.virtual_nodes) {
            return Err(ClusterError::configuration(
                "virtual_nodes must be within 1..=1024",
            ));
        }
        if self.network_timeout.is_zero() {
            return Err(ClusterError::configuration(
                "network_timeout must be positive",
            ));
        }
        if self.gossip_interval.is_zero() {
            return Err(ClusterError::configuration(
                "gossip_interval must be positive",
            ));
        }
        if self.seeds.iter().any(|seed| seed.id == self.node_id) {
            return Err(ClusterError::configuration(
                "seeds must not include the local node",
            ));
        }
        if self.compression_enabled {
            return Err(ClusterError::configuration(
                "compression_enabled is not supported by wire format v1",
            ));
        }
        if self.encryption_enabled {
            return Err(ClusterError::configuration(
                "encryption_enabled is not supported by wire format v1",
            ));
        }
        Ok(())
    }

    /// Acknowledgements needed for a strong quorum of `replicas` copies.
    pub(crate) fn quorum(replicas: usize) -> usize {
        replicas / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig::new("test", 1, "127.0.0.1:7001")
    }

    #[test]
    fn defaults_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn identity_fields_are_required() {
        let mut bad = config();
        bad.cluster_name.clear();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.bind_addr.clear();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn bounds_are_enforced() {
        let mut bad = config();
        bad.replication_factor = 0;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.partition_count = 0;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.virtual_nodes = 4096;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn self_seeding_is_rejected() {
        let mut bad = config();
        bad.seeds.push(SeedNode::new(1, "127.0.0.1:7001"));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn unsupported_wire_features_fail_fast() {
        let mut bad = config();
        bad.compression_enabled = true;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.encryption_enabled = true;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn quorum_is_majority() {
        assert_eq!(ClusterConfig::quorum(1), 1);
        assert_eq!(ClusterConfig::quorum(2), 2);
        assert_eq!(ClusterConfig::quorum(3), 2);
        assert_eq!(ClusterConfig::quorum(5), 3);
    }
}
