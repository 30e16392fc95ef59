//! In-process transport: peers exchange frames through a shared hub.
//!
//! Used by tests and single-process topologies. The hub can partition
//! nodes, which makes quorum-loss and read-repair scenarios reproducible
//! without sockets.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use super::{unreachable, RequestHandler, Transport, TransportMetrics, TransportStats};
use crate::error::ClusterResult;
use crate::topology::{NodeId, NodeInfo};

#[derive(Default)]
struct HubState {
    handlers: HashMap<NodeId, RequestHandler>,
    down: HashSet<NodeId>,
}

/// Shared mesh all [`MemoryTransport`]s of one logical cluster attach to.
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<HubState>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryNetwork::default())
    }

    /// Creates a transport endpoint for `node` on this hub.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: Arc::clone(self),
            node,
            handler: Mutex::new(None),
            metrics: TransportMetrics::default(),
        })
    }

    /// Drops all traffic to and from `node` until restored.
    pub fn partition(&self, node: NodeId) {
        self.state.lock().down.insert(node);
    }

    /// Reconnects a previously partitioned node.
    pub fn restore(&self, node: NodeId) {
        self.state.lock().down.remove(&node);
    }

    fn route(&self, to: NodeId) -> Option<RequestHandler> {
        let state = self.state.lock();
        if state.down.contains(&to) {
            return None;
        }
        state.handlers.get(&to).cloned()
    }

    fn is_down(&self, node: NodeId) -> bool {
        self.state.lock().down.contains(&node)
    }
}

/// One node's endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    node: NodeId,
    handler: Mutex<Option<RequestHandler>>,
    metrics: TransportMetrics,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> ClusterResult<()> {
        let handler = self
            .handler
            .lock()
            .clone()
            .expect("register_handler before start");
        self.network
            .state
            .lock()
            .handlers
            .insert(self.node, handler);
        Ok(())
    }

    async fn stop(&self) -> ClusterResult<()> {
        self.network.state.lock().handlers.remove(&self.node);
        Ok(())
    }

    async fn send(&self, to: &NodeInfo, payload: Bytes) -> ClusterResult<Bytes> {
        self.metrics.record_send(payload.len());

        // A partitioned sender cannot reach anyone either.
        if self.network.is_down(self.node) {
            self.metrics.record_failure();
            return Err(unreachable(to.id));
        }
        let Some(handler) = self.network.route(to.id) else {
            self.metrics.record_failure();
            return Err(unreachable(to.id));
        };

        match handler(self.node, payload).await {
            Ok(response) => {
                self.metrics.record_response(response.len());
                Ok(response)
            }
            Err(error) => {
                self.metrics.record_failure();
                Err(error)
            }
        }
    }

    fn register_handler(&self, handler: RequestHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn stats(&self) -> TransportStats {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;
    use futures::FutureExt;

    fn echo_handler(node: NodeId) -> RequestHandler {
        Arc::new(move |from, payload: Bytes| {
            let mut response = format!("{node}<-{from}:").into_bytes();
            response.extend_from_slice(&payload);
            async move { Ok(Bytes::from(response)) }.boxed()
        })
    }

    #[tokio::test]
    async fn frames_route_between_endpoints() {
        let hub = MemoryNetwork::new();
        let a = hub.transport(NodeId(1));
        let b = hub.transport(NodeId(2));
        a.register_handler(echo_handler(NodeId(1)));
        b.register_handler(echo_handler(NodeId(2)));
        a.start().await.unwrap();
        b.start().await.unwrap();

        let response = a
            .send(&NodeInfo::new(NodeId(2), "mem"), Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(&response[..], b"n2<-n1:hi");

        let stats = a.stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
    }

    #[tokio::test]
    async fn partitioned_nodes_are_unreachable() {
        let hub = MemoryNetwork::new();
        let a = hub.transport(NodeId(1));
        let b = hub.transport(NodeId(2));
        a.register_handler(echo_handler(NodeId(1)));
        b.register_handler(echo_handler(NodeId(2)));
        a.start().await.unwrap();
        b.start().await.unwrap();

        hub.partition(NodeId(2));
        let error = a
            .send(&NodeInfo::new(NodeId(2), "mem"), Bytes::from_static(b"hi"))
            .await
            .unwrap_err();
        assert!(matches!(error, ClusterError::NodeUnreachable { node } if node == NodeId(2)));

        hub.restore(NodeId(2));
        assert!(a
            .send(&NodeInfo::new(NodeId(2), "mem"), Bytes::from_static(b"hi"))
            .await
            .is_ok());
        assert_eq!(a.stats().send_failures, 1);
    }

    #[tokio::test]
    async fn stopped_endpoints_disappear_from_the_hub() {
        let hub = MemoryNetwork::new();
        let a = hub.transport(NodeId(1));
        let b = hub.transport(NodeId(2));
        a.register_handler(echo_handler(NodeId(1)));
        b.register_handler(echo_handler(NodeId(2)));
        a.start().await.unwrap();
        b.start().await.unwrap();

        b.stop().await.unwrap();
        let error = a
            .send(&NodeInfo::new(NodeId(2), "mem"), Bytes::from_static(b"hi"))
            .await
            .unwrap_err();
        assert!(matches!(error, ClusterError::NodeUnreachable { .. }));
    }
}
