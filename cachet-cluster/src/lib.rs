//! # cachet-cluster
//!
//! Distributed overlay for [`cachet_core`]: consistent-hash partitioning
//! with virtual nodes, replication-factor-N writes at tunable consistency,
//! version-based conflict resolution, read-repair, and a pluggable
//! request/response transport (framed TCP by default, in-process mesh for
//! tests).
//!
//! Each node wraps a local [`cachet_core::Cache`] of versioned values; any
//! node can coordinate any operation.

mod config;
mod coordinator;
mod error;
mod message;
mod ring;
mod topology;
mod transport;
mod version;

pub use config::{ClusterConfig, ConsistencyLevel, SeedNode};
pub use coordinator::{ClusterKey, ClusterStats, ClusterValue, DistributedCache, Session};
pub use error::{ClusterError, ClusterResult};
pub use message::{decode, encode, PeerRequest, PeerResponse, MAX_FRAME_BYTES};
pub use ring::HashRing;
pub use topology::{ClusterTopology, NodeId, NodeInfo, NodeStatus};
pub use transport::{
    MemoryNetwork, MemoryTransport, RequestHandler, TcpTransport, Transport, TransportStats,
};
pub use version::{Version, VersionClock, Versioned};
