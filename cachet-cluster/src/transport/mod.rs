//! # Transport
//!
//! Abstract request/response channel between peers. The overlay hands the
//! transport opaque frames; serialization stays in [`crate::message`].
//!
//! Failures are reported to the caller and never retried here: the overlay
//! decides what a failed replica means for the operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::{ClusterError, ClusterResult};
use crate::topology::{NodeId, NodeInfo};

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// Handles one inbound request frame and produces the response frame.
pub type RequestHandler =
    Arc<dyn Fn(NodeId, Bytes) -> BoxFuture<'static, ClusterResult<Bytes>> + Send + Sync>;

/// Point-in-time transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Requests handed to the wire.
    pub requests_sent: u64,
    /// Responses successfully received.
    pub responses_received: u64,
    /// Sends that failed or timed out.
    pub send_failures: u64,
    /// Inbound requests dispatched to the handler.
    pub requests_received: u64,
    /// Payload bytes written.
    pub bytes_sent: u64,
    /// Payload bytes read.
    pub bytes_received: u64,
}

/// Shared counter block used by transport implementations.
#[derive(Debug, Default)]
pub(crate) struct TransportMetrics {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    send_failures: AtomicU64,
    requests_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TransportMetrics {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_response(&self, bytes: usize) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_inbound(&self, bytes: usize) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Request/response channel to cluster peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts serving inbound requests. A handler must be registered first.
    async fn start(&self) -> ClusterResult<()>;

    /// Stops serving and releases connections. Idempotent.
    async fn stop(&self) -> ClusterResult<()>;

    /// Sends one request frame and awaits the peer's response frame.
    async fn send(&self, to: &NodeInfo, payload: Bytes) -> ClusterResult<Bytes>;

    /// Sends the same frame to many peers concurrently.
    async fn broadcast(
        &self,
        to: &[NodeInfo],
        payload: Bytes,
    ) -> Vec<(NodeId, ClusterResult<Bytes>)> {
        let sends = to.iter().map(|node| {
            let payload = payload.clone();
            async move { (node.id, self.send(node, payload).await) }
        });
        futures::future::join_all(sends).await
    }

    /// Registers the inbound request handler; replaces any previous one.
    fn register_handler(&self, handler: RequestHandler);

    /// Counter snapshot.
    fn stats(&self) -> TransportStats;
}

/// Maps a handler-or-send error onto the node it concerns.
pub(crate) fn unreachable(node: NodeId) -> ClusterError {
    ClusterError::NodeUnreachable { node }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_accumulate() {
        let metrics = TransportMetrics::default();
        metrics.record_send(100);
        metrics.record_response(40);
        metrics.record_failure();
        metrics.record_inbound(10);

        let stats = metrics.snapshot();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.requests_received, 1);
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.bytes_received, 50);
    }
}
