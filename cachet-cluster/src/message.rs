//! # Wire Messages
//!
//! Request/response pairs exchanged between peers.
//!
//! Wire format v1: every message is one bincode-encoded enum value carried
//! in a length-prefixed frame (`u32` big-endian payload length, then the
//! payload). Frames above [`MAX_FRAME_BYTES`] are rejected before decoding.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::topology::{NodeId, NodeInfo};
use crate::version::{Version, Versioned};

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Request sent from a coordinator to a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest<K, V> {
    /// Read the replica's copy of `key`.
    Get { key: K },
    /// Install `value` unless the replica already holds a newer version.
    Apply { key: K, value: Versioned<V> },
    /// Remove `key`; the version orders the removal against writes.
    Remove { key: K, version: Version },
    /// Exchange membership views.
    Gossip { from: NodeId, nodes: Vec<NodeInfo> },
    /// Bulk transfer of entries during partition handoff.
    Handoff { entries: Vec<(K, Versioned<V>)> },
    /// Liveness probe.
    Ping,
}

/// Response to a [`PeerRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse<V> {
    /// The replica's copy, if any.
    Value(Option<Versioned<V>>),
    /// Whether an `Apply` installed the value (false: newer copy held).
    Applied(bool),
    /// Whether a `Remove` dropped a live entry.
    Removed(bool),
    /// The peer's membership view.
    Gossip { nodes: Vec<NodeInfo> },
    /// Generic acknowledgement.
    Ack,
    /// Application-level failure; `code` follows the error taxonomy.
    Error { code: u16, message: String },
}

/// Encodes a message for the transport.
pub fn encode<T: Serialize>(message: &T) -> ClusterResult<Bytes> {
    let payload = bincode::serialize(message).map_err(ClusterError::serialization)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ClusterError::serialization(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }
    Ok(Bytes::from(payload))
}

/// Decodes a message received from the transport.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> ClusterResult<T> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ClusterError::serialization(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }
    bincode::deserialize(payload).map_err(ClusterError::serialization)
}
