//! # Coordinator
//!
//! The distributed cache: a node-local [`Cache`] of versioned values plus
//! the routing, replication, and repair logic that makes a set of such
//! nodes behave as one keyspace.
//!
//! Any node can coordinate any operation: it hashes the key onto the ring,
//! resolves the replica set, and dispatches per the configured consistency
//! level. Conflicts resolve by version, so replays and out-of-order
//! delivery are harmless.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use cachet_core::{Cache, CacheBuilder, CacheStats};
use futures::future::join_all;
use futures::FutureExt;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::{ClusterConfig, ConsistencyLevel, SeedNode};
use crate::error::{ClusterError, ClusterResult};
use crate::message::{decode, encode, PeerRequest, PeerResponse};
use crate::ring::{stable_hash, HashRing};
use crate::topology::{ClusterTopology, NodeId, NodeInfo};
use crate::transport::{Transport, TransportStats};
use crate::version::{Version, VersionClock, Versioned};

/// Bounds a key must satisfy to cross the wire.
pub trait ClusterKey:
    Hash + Eq + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
}
impl<T> ClusterKey for T where
    T: Hash + Eq + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Bounds a value must satisfy to cross the wire.
pub trait ClusterValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}
impl<T> ClusterValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Point-in-time counters of the overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterStats {
    /// Stale replicas rewritten after quorum reads.
    pub read_repairs: u64,
    /// Individual replica requests that failed.
    pub replica_failures: u64,
    /// Operations that could not assemble a quorum.
    pub quorum_failures: u64,
    /// Entries shipped away during partition handoff.
    pub handoff_entries: u64,
    /// Completed gossip rounds.
    pub gossip_rounds: u64,
}

#[derive(Default)]
struct ClusterStatsRecorder {
    read_repairs: AtomicU64,
    replica_failures: AtomicU64,
    quorum_failures: AtomicU64,
    handoff_entries: AtomicU64,
    gossip_rounds: AtomicU64,
}

impl ClusterStatsRecorder {
    fn snapshot(&self) -> ClusterStats {
        ClusterStats {
            read_repairs: self.read_repairs.load(Ordering::Relaxed),
            replica_failures: self.replica_failures.load(Ordering::Relaxed),
            quorum_failures: self.quorum_failures.load(Ordering::Relaxed),
            handoff_entries: self.handoff_entries.load(Ordering::Relaxed),
            gossip_rounds: self.gossip_rounds.load(Ordering::Relaxed),
        }
    }
}

/// Replicated cache node; cheap to clone, handles share one node.
pub struct DistributedCache<K, V> {
    inner: Arc<DistInner<K, V>>,
}

impl<K, V> Clone for DistributedCache<K, V> {
    fn clone(&self) -> Self {
        DistributedCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DistInner<K, V> {
    config: ClusterConfig,
    local_id: NodeId,
    /// Self-handle for background tasks spawned from `&self` methods.
    weak: Weak<DistInner<K, V>>,
    local: Cache<K, Versioned<V>>,
    topology: RwLock<ClusterTopology>,
    ring: RwLock<HashRing>,
    clock: VersionClock,
    transport: Arc<dyn Transport>,
    /// Per-key high watermarks for monotonic reads at this node.
    watermarks: Mutex<HashMap<K, Version>>,
    stats: ClusterStatsRecorder,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<K, V> DistributedCache<K, V>
where
    K: ClusterKey,
    V: ClusterValue,
{
    /// Starts a node: builds the local store, wires the transport handler,
    /// begins listening, and kicks off gossip. Must run inside a tokio
    /// runtime.
    pub async fn start(
        config: ClusterConfig,
        local: CacheBuilder<K, Versioned<V>>,
        transport: Arc<dyn Transport>,
    ) -> ClusterResult<Self> {
        config.validate()?;
        let local_cache = local.build()?;

        let local_id = NodeId(config.node_id);
        let local_info = NodeInfo::new(local_id, config.bind_addr.clone());
        let seeds: Vec<NodeInfo> = config.seeds.iter().map(SeedNode::info).collect();
        let topology = ClusterTopology::new(local_info, seeds, config.failure_threshold);
        let ring = HashRing::build(
            &topology.member_ids(),
            config.partition_count,
            config.virtual_nodes,
        );

        let inner = Arc::new_cyclic(|weak| DistInner {
            local_id,
            weak: weak.clone(),
            clock: VersionClock::new(local_id),
            local: local_cache,
            topology: RwLock::new(topology),
            ring: RwLock::new(ring),
            transport,
            watermarks: Mutex::new(HashMap::new()),
            stats: ClusterStatsRecorder::default(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let handler_inner = Arc::clone(&inner);
        inner.transport.register_handler(Arc::new(move |from, payload| {
            let inner = Arc::clone(&handler_inner);
            async move { inner.handle_request(from, payload).await }.boxed()
        }));
        inner.transport.start().await?;

        let gossip_inner = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(gossip_inner.config.gossip_interval).await;
                if gossip_inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                gossip_round(&gossip_inner).await;
            }
        });
        inner.tasks.lock().push(task);

        // Announce ourselves to the seeds right away.
        gossip_round(&inner).await;

        tracing::info!(
            cluster = %inner.config.cluster_name,
            node = %inner.local_id,
            "cluster node started"
        );
        Ok(DistributedCache { inner })
    }

    /// Writes `value` under `key` at the configured consistency level.
    pub async fn put(&self, key: K, value: V) -> ClusterResult<()> {
        self.inner.put_versioned(key, value).await.map(|_| ())
    }

    /// Reads `key` at the configured consistency level.
    pub async fn get(&self, key: &K) -> ClusterResult<Option<V>> {
        let result = self.inner.read(key, None).await?;
        Ok(result.map(|versioned| versioned.value))
    }

    /// Removes `key`; returns whether any replica dropped a live entry.
    pub async fn remove(&self, key: K) -> ClusterResult<bool> {
        self.inner.remove(key).await
    }

    /// Opens a logical session whose reads observe its own writes.
    pub fn session(&self) -> Session<K, V> {
        Session {
            inner: Arc::clone(&self.inner),
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    /// This node's copy of `key`, bypassing the cluster. Diagnostic.
    pub fn local_value(&self, key: &K) -> Option<V> {
        self.inner
            .local
            .get(key)
            .ok()
            .flatten()
            .map(|arc| arc.value.clone())
    }

    /// Known members and their health, from this node's view.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.inner.topology.read().nodes()
    }

    /// Overlay counters.
    pub fn stats(&self) -> ClusterStats {
        self.inner.stats.snapshot()
    }

    /// Node-local cache counters.
    pub fn local_stats(&self) -> CacheStats {
        self.inner.local.stats()
    }

    /// Transport counters.
    pub fn transport_stats(&self) -> TransportStats {
        self.inner.transport.stats()
    }

    /// Stops gossip, releases the transport, and closes the local store.
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let _ = self.inner.transport.stop().await;
        self.inner.local.close();
        tracing::debug!(node = %self.inner.local_id, "cluster node closed");
    }
}

impl<K, V> DistInner<K, V>
where
    K: ClusterKey,
    V: ClusterValue,
{
    fn check_open(&self) -> ClusterResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClusterError::Closed)
        } else {
            Ok(())
        }
    }

    /// Deterministic key hash shared by every coordinator.
    fn key_hash(&self, key: &K) -> ClusterResult<u64> {
        let bytes = bincode::serialize(key).map_err(ClusterError::serialization)?;
        Ok(stable_hash(&bytes))
    }

    /// Ordered replica set for `key`, resolved to addresses.
    fn replica_infos(&self, key: &K) -> ClusterResult<Vec<NodeInfo>> {
        let hash = self.key_hash(key)?;
        let ids = self
            .ring
            .read()
            .replicas_for_hash(hash, self.config.replication_factor);
        let topology = self.topology.read();
        Ok(ids
            .into_iter()
            .filter_map(|id| topology.get(id).cloned())
            .collect())
    }

    /// Installs `value` locally unless a newer version is already held.
    fn apply_local(&self, key: K, value: Versioned<V>) -> ClusterResult<bool> {
        let mut applied = false;
        self.local.compute(key, |_key, current| match current {
            Some(current) if current.version >= value.version => Some((*current).clone()),
            _ => {
                applied = true;
                Some(value.clone())
            }
        })?;
        Ok(applied)
    }

    /// One request to one peer, failing fast on unreachable targets.
    async fn send_raw(&self, node: &NodeInfo, payload: Bytes) -> ClusterResult<PeerResponse<V>> {
        if !node.is_reachable() {
            self.stats.replica_failures.fetch_add(1, Ordering::Relaxed);
            return Err(ClusterError::NodeUnreachable { node: node.id });
        }
        self.probe_raw(node, payload).await
    }

    /// One request to one peer regardless of its recorded status; gossip
    /// uses this so unreachable nodes can recover.
    async fn probe_raw(&self, node: &NodeInfo, payload: Bytes) -> ClusterResult<PeerResponse<V>> {
        if node.id == self.local_id {
            return Err(ClusterError::configuration(
                "peer requests must not target the local node",
            ));
        }

        match self.transport.send(node, payload).await {
            Ok(bytes) => {
                self.topology.write().record_success(node.id);
                match decode::<PeerResponse<V>>(&bytes)? {
                    PeerResponse::Error { code, message } => {
                        Err(ClusterError::Peer { code, message })
                    }
                    response => Ok(response),
                }
            }
            Err(error) => {
                let status = self.topology.write().record_failure(node.id);
                self.stats.replica_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(node = %node.id, ?status, %error, "replica request failed");
                Err(error)
            }
        }
    }

    async fn put_versioned(&self, key: K, value: V) -> ClusterResult<Version> {
        self.check_open()?;
        let version = self.clock.next();
        let versioned = Versioned::new(value, version);
        let replicas = self.replica_infos(&key)?;
        if replicas.is_empty() {
            return Err(ClusterError::configuration("hash ring has no members"));
        }

        match self.config.consistency {
            ConsistencyLevel::Strong => {
                self.replicate_strong(&key, &versioned, &replicas).await?
            }
            _ => self.replicate_eventual(&key, &versioned, &replicas).await?,
        }

        if self.config.consistency == ConsistencyLevel::MonotonicRead {
            self.bump_watermark(&key, version);
        }
        Ok(version)
    }

    async fn replicate_strong(
        &self,
        key: &K,
        versioned: &Versioned<V>,
        replicas: &[NodeInfo],
    ) -> ClusterResult<()> {
        let required = ClusterConfig::quorum(replicas.len());
        let payload = encode(&PeerRequest::Apply {
            key: key.clone(),
            value: versioned.clone(),
        })?;

        let mut acked = 0;
        let mut sends = Vec::new();
        for node in replicas {
            if node.id == self.local_id {
                if self.apply_local(key.clone(), versioned.clone()).is_ok() {
                    acked += 1;
                }
            } else {
                sends.push(self.send_raw(node, payload.clone()));
            }
        }
        for result in join_all(sends).await {
            if matches!(result, Ok(PeerResponse::Applied(_))) {
                acked += 1;
            }
        }

        if acked >= required {
            Ok(())
        } else {
            self.stats.quorum_failures.fetch_add(1, Ordering::Relaxed);
            Err(ClusterError::NetworkPartition { required, acked })
        }
    }

    async fn replicate_eventual(
        &self,
        key: &K,
        versioned: &Versioned<V>,
        replicas: &[NodeInfo],
    ) -> ClusterResult<()> {
        let payload = encode(&PeerRequest::Apply {
            key: key.clone(),
            value: versioned.clone(),
        })?;

        // Apply at one authoritative replica before returning.
        let mut applied_at = None;
        if replicas.iter().any(|node| node.id == self.local_id) {
            self.apply_local(key.clone(), versioned.clone())?;
            applied_at = Some(self.local_id);
        } else {
            for node in replicas {
                if self.send_raw(node, payload.clone()).await.is_ok() {
                    applied_at = Some(node.id);
                    break;
                }
            }
        }
        let Some(applied_at) = applied_at else {
            self.stats.quorum_failures.fetch_add(1, Ordering::Relaxed);
            return Err(ClusterError::NetworkPartition {
                required: 1,
                acked: 0,
            });
        };

        // Everyone else catches up in the background.
        let targets: Vec<NodeInfo> = replicas
            .iter()
            .filter(|node| node.id != self.local_id && node.id != applied_at)
            .cloned()
            .collect();
        if !targets.is_empty() {
            let inner = self.clone_self();
            tokio::spawn(async move {
                for node in targets {
                    let _ = inner.send_raw(&node, payload.clone()).await;
                }
            });
        }
        Ok(())
    }

    async fn remove(&self, key: K) -> ClusterResult<bool> {
        self.check_open()?;
        let version = self.clock.next();
        let replicas = self.replica_infos(&key)?;
        let payload = encode(&PeerRequest::<K, V>::Remove {
            key: key.clone(),
            version,
        })?;

        let is_replica = replicas.iter().any(|node| node.id == self.local_id);
        let mut removed = false;
        if is_replica {
            removed = self.local.remove(key.clone())?.is_some();
        }

        match self.config.consistency {
            ConsistencyLevel::Strong => {
                let required = ClusterConfig::quorum(replicas.len());
                let mut acked = usize::from(is_replica);
                let sends: Vec<_> = replicas
                    .iter()
                    .filter(|node| node.id != self.local_id)
                    .map(|node| self.send_raw(node, payload.clone()))
                    .collect();
                for result in join_all(sends).await {
                    match result {
                        Ok(PeerResponse::Removed(dropped)) => {
                            acked += 1;
                            removed |= dropped;
                        }
                        _ => {}
                    }
                }
                if acked < required {
                    self.stats.quorum_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(ClusterError::NetworkPartition { required, acked });
                }
            }
            _ => {
                let targets: Vec<NodeInfo> = replicas
                    .iter()
                    .filter(|node| node.id != self.local_id)
                    .cloned()
                    .collect();
                if !targets.is_empty() {
                    let inner = self.clone_self();
                    tokio::spawn(async move {
                        for node in targets {
                            let _ = inner.send_raw(&node, payload.clone()).await;
                        }
                    });
                }
            }
        }
        Ok(removed)
    }

    /// Reads `key`, honoring `floor` (never return anything older) and the
    /// node's consistency level.
    async fn read(&self, key: &K, floor: Option<Version>) -> ClusterResult<Option<Versioned<V>>> {
        self.check_open()?;
        let replicas = self.replica_infos(key)?;

        let effective_floor = match self.config.consistency {
            ConsistencyLevel::MonotonicRead => {
                let watermark = self.watermarks.lock().get(key).copied();
                floor.max(watermark)
            }
            _ => floor,
        };

        let result = match self.config.consistency {
            ConsistencyLevel::Strong => self.quorum_read(key, &replicas).await?,
            _ => self.fast_read(key, &replicas, effective_floor).await?,
        };

        if self.config.consistency == ConsistencyLevel::MonotonicRead {
            if let Some(versioned) = &result {
                self.bump_watermark(key, versioned.version);
            }
        }
        Ok(result)
    }

    /// Local-first read; escalates to a quorum read when the floor cannot
    /// be satisfied cheaply.
    async fn fast_read(
        &self,
        key: &K,
        replicas: &[NodeInfo],
        floor: Option<Version>,
    ) -> ClusterResult<Option<Versioned<V>>> {
        let satisfies = |candidate: &Versioned<V>| floor.map_or(true, |f| candidate.version >= f);

        let is_replica = replicas.iter().any(|node| node.id == self.local_id);
        if is_replica {
            if let Some(local) = self.local.get(key)? {
                let local = (*local).clone();
                if satisfies(&local) {
                    return Ok(Some(local));
                }
            }
        }

        let payload = encode(&PeerRequest::<K, V>::Get { key: key.clone() })?;
        for node in replicas.iter().filter(|node| node.id != self.local_id) {
            match self.send_raw(node, payload.clone()).await {
                Ok(PeerResponse::Value(found)) => match found {
                    Some(value) if satisfies(&value) => {
                        // Read-through: a replica that missed locally keeps
                        // a copy for next time.
                        if is_replica {
                            let _ = self.apply_local(key.clone(), value.clone());
                        }
                        return Ok(Some(value));
                    }
                    other => {
                        if floor.is_none() {
                            return Ok(other);
                        }
                    }
                },
                _ => continue,
            }
        }

        if floor.is_some() {
            // Nothing cheap satisfied the floor; a quorum read overlaps any
            // acknowledged write.
            return self.quorum_read(key, replicas).await;
        }
        Ok(None)
    }

    /// Queries a quorum, returns the version-latest copy, and repairs the
    /// stragglers.
    async fn quorum_read(
        &self,
        key: &K,
        replicas: &[NodeInfo],
    ) -> ClusterResult<Option<Versioned<V>>> {
        let required = ClusterConfig::quorum(replicas.len());
        let payload = encode(&PeerRequest::<K, V>::Get { key: key.clone() })?;

        let mut responses: Vec<(NodeId, Option<Versioned<V>>)> = Vec::new();
        if replicas.iter().any(|node| node.id == self.local_id) {
            let local = self.local.get(key)?.map(|arc| (*arc).clone());
            responses.push((self.local_id, local));
        }

        let remotes: Vec<&NodeInfo> = replicas
            .iter()
            .filter(|node| node.id != self.local_id)
            .collect();
        let sends: Vec<_> = remotes
            .iter()
            .map(|node| self.send_raw(*node, payload.clone()))
            .collect();
        for (node, result) in remotes.iter().zip(join_all(sends).await) {
            if let Ok(PeerResponse::Value(value)) = result {
                responses.push((node.id, value));
            }
        }

        if responses.len() < required {
            self.stats.quorum_failures.fetch_add(1, Ordering::Relaxed);
            // Degraded read: serve the local copy of an already-committed
            // key rather than failing a sole survivor.
            if let Some((_, Some(local))) = responses
                .iter()
                .find(|(id, value)| *id == self.local_id && value.is_some())
            {
                return Ok(Some(local.clone()));
            }
            return Err(ClusterError::NetworkPartition {
                required,
                acked: responses.len(),
            });
        }

        let winner = responses
            .iter()
            .filter_map(|(_, value)| value.as_ref())
            .max_by_key(|value| value.version)
            .cloned();

        if let (Some(winner), true) = (&winner, self.config.read_repair) {
            self.repair_stale(key, winner, &responses);
        }
        Ok(winner)
    }

    /// Asynchronously rewrites replicas that answered with an older copy.
    fn repair_stale(
        &self,
        key: &K,
        winner: &Versioned<V>,
        responses: &[(NodeId, Option<Versioned<V>>)],
    ) {
        let stale: Vec<NodeId> = responses
            .iter()
            .filter(|(_, value)| {
                value
                    .as_ref()
                    .map_or(true, |value| value.version < winner.version)
            })
            .map(|(id, _)| *id)
            .collect();
        if stale.is_empty() {
            return;
        }

        self.stats
            .read_repairs
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        let inner = self.clone_self();
        let key = key.clone();
        let winner = winner.clone();
        tokio::spawn(async move {
            let Ok(payload) = encode(&PeerRequest::Apply {
                key: key.clone(),
                value: winner.clone(),
            }) else {
                return;
            };
            for node_id in stale {
                if node_id == inner.local_id {
                    let _ = inner.apply_local(key.clone(), winner.clone());
                    continue;
                }
                let info = inner.topology.read().get(node_id).cloned();
                if let Some(info) = info {
                    let _ = inner.send_raw(&info, payload.clone()).await;
                }
            }
        });
    }

    fn bump_watermark(&self, key: &K, version: Version) {
        let mut watermarks = self.watermarks.lock();
        let slot = watermarks.entry(key.clone()).or_insert(version);
        if *slot < version {
            *slot = version;
        }
    }

    fn rebuild_ring(&self) {
        let members = self.topology.read().member_ids();
        *self.ring.write() = HashRing::build(
            &members,
            self.config.partition_count,
            self.config.virtual_nodes,
        );
        tracing::debug!(node = %self.local_id, members = members.len(), "ring rebuilt");
    }

    /// Handles one inbound peer request.
    async fn handle_request(self: Arc<Self>, from: NodeId, payload: Bytes) -> ClusterResult<Bytes> {
        let request: PeerRequest<K, V> = decode(&payload)?;
        let response: PeerResponse<V> = match request {
            PeerRequest::Get { key } => match self.local.get(&key) {
                Ok(value) => PeerResponse::Value(value.map(|arc| (*arc).clone())),
                Err(error) => PeerResponse::Error {
                    code: error.code(),
                    message: error.to_string(),
                },
            },
            PeerRequest::Apply { key, value } => {
                self.clock.observe(value.version);
                match self.apply_local(key, value) {
                    Ok(applied) => PeerResponse::Applied(applied),
                    Err(error) => PeerResponse::Error {
                        code: error.code(),
                        message: error.to_string(),
                    },
                }
            }
            PeerRequest::Remove { key, version } => {
                self.clock.observe(version);
                match self.local.remove(key) {
                    Ok(previous) => PeerResponse::Removed(previous.is_some()),
                    Err(error) => PeerResponse::Error {
                        code: error.code(),
                        message: error.to_string(),
                    },
                }
            }
            PeerRequest::Gossip { from: origin, nodes } => {
                let changed = {
                    let mut topology = self.topology.write();
                    topology.record_success(origin);
                    topology.merge(nodes)
                };
                if changed {
                    self.rebuild_ring();
                    spawn_rebalance(&self);
                }
                PeerResponse::Gossip {
                    nodes: self.topology.read().nodes(),
                }
            }
            PeerRequest::Handoff { entries } => {
                for (key, value) in entries {
                    self.clock.observe(value.version);
                    let _ = self.apply_local(key, value);
                }
                PeerResponse::Ack
            }
            PeerRequest::Ping => PeerResponse::Ack,
        };
        tracing::trace!(node = %self.local_id, %from, "handled peer request");
        encode(&response)
    }

    fn clone_self(&self) -> Arc<Self> {
        self.weak.upgrade().expect("inner is alive while borrowed")
    }
}

/// One gossip round: push our view to every peer, merge what comes back.
async fn gossip_round<K, V>(inner: &Arc<DistInner<K, V>>)
where
    K: ClusterKey,
    V: ClusterValue,
{
    let snapshot = {
        let mut topology = inner.topology.write();
        topology.touch_local();
        topology.nodes()
    };
    let peers: Vec<NodeInfo> = snapshot
        .iter()
        .filter(|node| node.id != inner.local_id && node.is_member())
        .cloned()
        .collect();
    if peers.is_empty() {
        inner.stats.gossip_rounds.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let Ok(payload) = encode(&PeerRequest::<K, V>::Gossip {
        from: inner.local_id,
        nodes: snapshot,
    }) else {
        return;
    };

    let mut changed = false;
    for peer in peers {
        if let Ok(PeerResponse::Gossip { nodes }) = inner.probe_raw(&peer, payload.clone()).await {
            changed |= inner.topology.write().merge(nodes);
        }
    }
    if changed {
        inner.rebuild_ring();
        spawn_rebalance(inner);
    }
    inner.stats.gossip_rounds.fetch_add(1, Ordering::Relaxed);
}

/// Kicks off an asynchronous, idempotent handoff of entries this node no
/// longer owns. Safe to run repeatedly; applies are version-gated.
fn spawn_rebalance<K, V>(inner: &Arc<DistInner<K, V>>)
where
    K: ClusterKey,
    V: ClusterValue,
{
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        rebalance(&inner).await;
    });
}

async fn rebalance<K, V>(inner: &Arc<DistInner<K, V>>)
where
    K: ClusterKey,
    V: ClusterValue,
{
    // Entries whose replica set no longer includes this node.
    let mut orphaned: Vec<(K, Versioned<V>)> = Vec::new();
    {
        let ring = inner.ring.read();
        let factor = inner.config.replication_factor;
        let local_id = inner.local_id;
        let mut collect = |key: &K, value: &Arc<Versioned<V>>| {
            let Ok(bytes) = bincode::serialize(key) else {
                return;
            };
            let replicas = ring.replicas_for_hash(stable_hash(&bytes), factor);
            if !replicas.contains(&local_id) {
                orphaned.push((key.clone(), (**value).clone()));
            }
        };
        if inner.local.for_each(|key, value| collect(key, value)).is_err() {
            return;
        }
    }
    if orphaned.is_empty() {
        return;
    }

    // Group the orphans by their new replicas and ship them in chunks.
    let mut batches: HashMap<NodeId, Vec<(K, Versioned<V>)>> = HashMap::new();
    {
        let ring = inner.ring.read();
        for (key, value) in &orphaned {
            let Ok(bytes) = bincode::serialize(key) else {
                continue;
            };
            for node in ring.replicas_for_hash(stable_hash(&bytes), inner.config.replication_factor)
            {
                batches
                    .entry(node)
                    .or_default()
                    .push((key.clone(), value.clone()));
            }
        }
    }

    let mut delivered: HashMap<K, bool> = orphaned
        .iter()
        .map(|(key, _)| (key.clone(), false))
        .collect();
    for (node_id, entries) in batches {
        let info = inner.topology.read().get(node_id).cloned();
        let Some(info) = info else { continue };
        for chunk in entries.chunks(128) {
            let Ok(payload) = encode(&PeerRequest::Handoff {
                entries: chunk.to_vec(),
            }) else {
                continue;
            };
            if inner.send_raw(&info, payload).await.is_ok() {
                inner
                    .stats
                    .handoff_entries
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                for (key, _) in chunk {
                    delivered.insert(key.clone(), true);
                }
            }
        }
    }

    // Drop only what at least one new owner has confirmed.
    for (key, ok) in delivered {
        if ok {
            let _ = inner.local.remove(key);
        }
    }
}

/// Session-scoped view: reads observe the session's own writes.
pub struct Session<K, V> {
    inner: Arc<DistInner<K, V>>,
    watermarks: Mutex<HashMap<K, Version>>,
}

impl<K, V> Session<K, V>
where
    K: ClusterKey,
    V: ClusterValue,
{
    /// Writes through the cluster and remembers the version for this
    /// session's later reads.
    pub async fn put(&self, key: K, value: V) -> ClusterResult<()> {
        let version = self.inner.put_versioned(key.clone(), value).await?;
        self.watermarks.lock().insert(key, version);
        Ok(())
    }

    /// Reads at least as fresh as this session's own writes.
    pub async fn get(&self, key: &K) -> ClusterResult<Option<V>> {
        let floor = self.watermarks.lock().get(key).copied();
        let result = self.inner.read(key, floor).await?;
        if let Some(versioned) = &result {
            let mut watermarks = self.watermarks.lock();
            let slot = watermarks.entry(key.clone()).or_insert(versioned.version);
            if *slot < versioned.version {
                *slot = versioned.version;
            }
        }
        Ok(result.map(|versioned| versioned.value))
    }
}
