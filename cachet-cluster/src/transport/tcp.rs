//! Framed TCP transport.
//!
//! Wire format v1: a request frame is `[len: u32 BE][sender: u64 BE]
//! [payload]`, a response frame is `[len: u32 BE][payload]`; `len` covers
//! everything after itself. One request/response exchange owns its
//! connection at a time; idle connections are pooled per peer.
//!
//! Failed sends are reported to the overlay and not retried here beyond
//! the configured connect attempts.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{RequestHandler, Transport, TransportMetrics, TransportStats};
use crate::error::{ClusterError, ClusterResult};
use crate::message::MAX_FRAME_BYTES;
use crate::topology::{NodeId, NodeInfo};

/// Idle connections kept per peer.
const MAX_IDLE_PER_PEER: usize = 4;

/// Pause between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(20);

/// TCP implementation of [`Transport`].
pub struct TcpTransport {
    node: NodeId,
    bind_addr: String,
    request_timeout: Duration,
    max_reconnect_attempts: u32,
    handler: Mutex<Option<RequestHandler>>,
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
    metrics: Arc<TransportMetrics>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Arc<Notify>,
    stopped: AtomicBool,
}

impl TcpTransport {
    pub fn new(
        node: NodeId,
        bind_addr: impl Into<String>,
        request_timeout: Duration,
        max_reconnect_attempts: u32,
    ) -> Arc<Self> {
        Arc::new(TcpTransport {
            node,
            bind_addr: bind_addr.into(),
            request_timeout,
            max_reconnect_attempts: max_reconnect_attempts.max(1),
            handler: Mutex::new(None),
            idle: Mutex::new(HashMap::new()),
            metrics: Arc::new(TransportMetrics::default()),
            listener_task: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Address the listener actually bound; useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn take_idle(&self, addr: &str) -> Option<TcpStream> {
        self.idle.lock().get_mut(addr).and_then(|pool| pool.pop())
    }

    fn park_idle(&self, addr: &str, stream: TcpStream) {
        let mut idle = self.idle.lock();
        let pool = idle.entry(addr.to_string()).or_default();
        if pool.len() < MAX_IDLE_PER_PEER {
            pool.push(stream);
        }
    }

    async fn connect(&self, to: &NodeInfo) -> ClusterResult<TcpStream> {
        for attempt in 0..self.max_reconnect_attempts {
            if attempt > 0 {
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
            let connecting = TcpStream::connect(&to.addr);
            match tokio::time::timeout(self.request_timeout, connecting).await {
                Ok(Ok(stream)) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|_| ClusterError::NodeUnreachable { node: to.id })?;
                    return Ok(stream);
                }
                Ok(Err(error)) => {
                    tracing::debug!(node = %to.id, addr = %to.addr, %error, "connect failed");
                }
                Err(_) => {
                    tracing::debug!(node = %to.id, addr = %to.addr, "connect timed out");
                }
            }
        }
        Err(ClusterError::NodeUnreachable { node: to.id })
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        to: NodeId,
        payload: &Bytes,
    ) -> ClusterResult<Bytes> {
        let io = async {
            write_request(stream, self.node, payload).await?;
            read_response(stream).await
        };
        match tokio::time::timeout(self.request_timeout, io).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout { node: to }),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> ClusterResult<()> {
        let handler = self
            .handler
            .lock()
            .clone()
            .expect("register_handler before start");

        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|error| ClusterError::configuration(format!(
                "cannot bind {}: {error}",
                self.bind_addr
            )))?;
        let local = listener.local_addr().map_err(|error| {
            ClusterError::configuration(format!("cannot resolve bound address: {error}"))
        })?;
        *self.local_addr.lock() = Some(local);
        tracing::info!(node = %self.node, addr = %local, "transport listening");

        let metrics = Arc::clone(&self.metrics);
        let shutdown = Arc::clone(&self.shutdown);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let handler = handler.clone();
                        let metrics = Arc::clone(&metrics);
                        tokio::spawn(serve_connection(stream, handler, metrics));
                    }
                }
            }
        });
        *self.listener_task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> ClusterResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.notify_waiters();
        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }
        self.idle.lock().clear();
        Ok(())
    }

    async fn send(&self, to: &NodeInfo, payload: Bytes) -> ClusterResult<Bytes> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClusterError::Closed);
        }
        self.metrics.record_send(payload.len());

        // A pooled connection may have gone stale; a fresh one gets no
        // second chance, matching the no-retry contract.
        let (mut stream, pooled) = match self.take_idle(&to.addr) {
            Some(stream) => (stream, true),
            None => match self.connect(to).await {
                Ok(stream) => (stream, false),
                Err(error) => {
                    self.metrics.record_failure();
                    return Err(error);
                }
            },
        };

        match self.exchange(&mut stream, to.id, &payload).await {
            Ok(response) => {
                self.metrics.record_response(response.len());
                self.park_idle(&to.addr, stream);
                Ok(response)
            }
            Err(error) if pooled => {
                drop(stream);
                let mut fresh = match self.connect(to).await {
                    Ok(fresh) => fresh,
                    Err(connect_error) => {
                        self.metrics.record_failure();
                        return Err(connect_error);
                    }
                };
                tracing::debug!(node = %to.id, %error, "retrying once on a fresh connection");
                match self.exchange(&mut fresh, to.id, &payload).await {
                    Ok(response) => {
                        self.metrics.record_response(response.len());
                        self.park_idle(&to.addr, fresh);
                        Ok(response)
                    }
                    Err(retry_error) => {
                        self.metrics.record_failure();
                        Err(retry_error)
                    }
                }
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

/// Serves one inbound connection until it closes or misbehaves.
async fn serve_connection(
    mut stream: TcpStream,
    handler: RequestHandler,
    metrics: Arc<TransportMetrics>,
) {
    loop {
        let (from, payload) = match read_request(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        metrics.record_inbound(payload.len());

        let response = match handler(from, payload).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, "request handler failed; closing connection");
                return;
            }
        };
        if write_response(&mut stream, &response).await.is_err() {
            return;
        }
    }
}

async fn write_request(
    stream: &mut TcpStream,
    sender: NodeId,
    payload: &Bytes,
) -> ClusterResult<()> {
    let len = (payload.len() + 8) as u32;
    let mut frame = Vec::with_capacity(12 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&sender.0.to_be_bytes());
    frame.extend_from_slice(payload);
    stream
        .write_all(&frame)
        .await
        .map_err(|error| ClusterError::serialization(format!("write failed: {error}")))
}

async fn read_request(stream: &mut TcpStream) -> ClusterResult<(NodeId, Bytes)> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|error| ClusterError::serialization(format!("read failed: {error}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 8 || len > MAX_FRAME_BYTES + 8 {
        return Err(ClusterError::serialization(format!(
            "invalid request frame length {len}"
        )));
    }

    let mut sender_buf = [0u8; 8];
    stream
        .read_exact(&mut sender_buf)
        .await
        .map_err(|error| ClusterError::serialization(format!("read failed: {error}")))?;

    let mut payload = vec![0u8; len - 8];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|error| ClusterError::serialization(format!("read failed: {error}")))?;
    Ok((NodeId(u64::from_be_bytes(sender_buf)), Bytes::from(payload)))
}

async fn write_response(stream: &mut TcpStream, payload: &Bytes) -> ClusterResult<()> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    stream
        .write_all(&frame)
        .await
        .map_err(|error| ClusterError::serialization(format!("write failed: {error}")))
}

async fn read_response(stream: &mut TcpStream) -> ClusterResult<Bytes> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|error| ClusterError::serialization(format!("read failed: {error}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ClusterError::serialization(format!(
            "invalid response frame length {len}"
        )));
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|error| ClusterError::serialization(format!("read failed: {error}")))?;
    Ok(Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn echo_handler() -> RequestHandler {
        Arc::new(|from, payload: Bytes| {
            let mut response = format!("from-{from}:").into_bytes();
            response.extend_from_slice(&payload);
            async move { Ok(Bytes::from(response)) }.boxed()
        })
    }

    fn peer(id: u64, addr: SocketAddr) -> NodeInfo {
        NodeInfo::new(NodeId(id), addr.to_string())
    }

    #[tokio::test]
    async fn request_response_round_trips() {
        let server = TcpTransport::new(NodeId(2), "127.0.0.1:0", Duration::from_secs(1), 1);
        server.register_handler(echo_handler());
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = TcpTransport::new(NodeId(1), "127.0.0.1:0", Duration::from_secs(1), 1);
        client.register_handler(echo_handler());
        client.start().await.unwrap();

        let response = client
            .send(&peer(2, addr), Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(&response[..], b"from-n1:ping");

        // A second request reuses the pooled connection.
        let response = client
            .send(&peer(2, addr), Bytes::from_static(b"pong"))
            .await
            .unwrap();
        assert_eq!(&response[..], b"from-n1:pong");

        let stats = client.stats();
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.responses_received, 2);

        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_peer_fails_fast() {
        let client = TcpTransport::new(NodeId(1), "127.0.0.1:0", Duration::from_millis(200), 2);
        client.register_handler(echo_handler());
        client.start().await.unwrap();

        // A port nobody listens on.
        let error = client
            .send(
                &NodeInfo::new(NodeId(9), "127.0.0.1:1"),
                Bytes::from_static(b"ping"),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, ClusterError::NodeUnreachable { node } if node == NodeId(9)));
        assert_eq!(client.stats().send_failures, 1);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stopped_transport_rejects_sends() {
        let transport = TcpTransport::new(NodeId(1), "127.0.0.1:0", Duration::from_secs(1), 1);
        transport.register_handler(echo_handler());
        transport.start().await.unwrap();
        transport.stop().await.unwrap();
        transport.stop().await.unwrap();

        let error = transport
            .send(
                &NodeInfo::new(NodeId(2), "127.0.0.1:1"),
                Bytes::from_static(b"ping"),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, ClusterError::Closed));
    }
}
