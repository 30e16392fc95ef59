//! # Cluster Errors
//!
//! Failure kinds for distributed operations, with the same stable-code and
//! retry-hint conventions as the local cache errors. Codes 4xx are cluster
//! specific; local cache failures pass through with their own codes.

use cachet_core::CacheError;
use thiserror::Error;

use crate::topology::NodeId;

/// Result alias for distributed operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by the distributed overlay.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    /// Invalid options detected while starting the node.
    #[error("invalid cluster configuration: {reason}")]
    Configuration {
        /// Human-readable description of the rejected option.
        reason: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization failed: {reason}")]
    Serialization {
        /// Codec error description.
        reason: String,
    },

    /// Fewer than a quorum of replicas acknowledged the operation.
    #[error("network partition: {acked} of {required} required replicas acknowledged")]
    NetworkPartition {
        /// Acknowledgements required for the consistency level.
        required: usize,
        /// Acknowledgements actually received.
        acked: usize,
    },

    /// A single peer could not be reached; counted, usually not fatal.
    #[error("node {node} unreachable")]
    NodeUnreachable {
        /// The peer that failed.
        node: NodeId,
    },

    /// A peer did not answer within the configured network timeout.
    #[error("request to node {node} timed out")]
    Timeout {
        /// The peer that timed out.
        node: NodeId,
    },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The distributed cache was closed.
    #[error("distributed cache is closed")]
    Closed,

    /// A peer answered with an application-level error.
    #[error("peer error {code}: {message}")]
    Peer {
        /// Stable error code reported by the peer.
        code: u16,
        /// Peer-provided description.
        message: String,
    },

    /// The node-local cache failed.
    #[error(transparent)]
    Local(#[from] CacheError),
}

impl ClusterError {
    /// Builds a configuration error from any displayable reason.
    pub fn configuration(reason: impl Into<String>) -> Self {
        ClusterError::Configuration {
            reason: reason.into(),
        }
    }

    /// Builds a serialization error from a codec failure.
    pub fn serialization(reason: impl std::fmt::Display) -> Self {
        ClusterError::Serialization {
            reason: reason.to_string(),
        }
    }

    /// Returns the stable numeric code for this error kind.
    pub fn code(&self) -> u16 {
        match self {
            ClusterError::Configuration { .. } => 100,
            ClusterError::Closed => 103,
            ClusterError::Serialization { .. } => 400,
            ClusterError::NetworkPartition { .. } => 401,
            ClusterError::NodeUnreachable { .. } => 402,
            ClusterError::Timeout { .. } => 403,
            ClusterError::Cancelled => 404,
            ClusterError::Peer { code, .. } => *code,
            ClusterError::Local(inner) => inner.code(),
        }
    }

    /// Returns true when retrying the failed operation can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterError::NetworkPartition { .. }
            | ClusterError::NodeUnreachable { .. }
            | ClusterError::Timeout { .. } => true,
            ClusterError::Local(inner) => inner.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ClusterError::configuration("x").code(), 100);
        assert_eq!(ClusterError::Closed.code(), 103);
        assert_eq!(ClusterError::serialization("x").code(), 400);
        assert_eq!(
            ClusterError::NetworkPartition {
                required: 2,
                acked: 1
            }
            .code(),
            401
        );
        assert_eq!(
            ClusterError::NodeUnreachable { node: NodeId(7) }.code(),
            402
        );
        assert_eq!(ClusterError::Timeout { node: NodeId(7) }.code(), 403);
        assert_eq!(ClusterError::Cancelled.code(), 404);
    }

    #[test]
    fn retry_hints_follow_the_taxonomy() {
        assert!(ClusterError::NetworkPartition {
            required: 2,
            acked: 1
        }
        .is_retryable());
        assert!(ClusterError::NodeUnreachable { node: NodeId(1) }.is_retryable());
        assert!(!ClusterError::serialization("x").is_retryable());
        assert!(!ClusterError::Cancelled.is_retryable());
        assert!(ClusterError::Local(CacheError::load_failed("x")).is_retryable());
    }
}
