//! In-process cluster harness: a simulated network that can delay and cut
//! links, and helpers to stand up election clusters over one shared store.

use crate::{
    config::ElectionConfig,
    election::{self, ElectionHandle, LeadershipState},
    error::Error,
    lease::LeaseManager,
    message::{Heartbeat, HeartbeatAck, Message, VoteRequest, VoteResponse},
    store::{CasOutcome, CasRequest, LeaseStore, MemoryStore, Snapshot, StoreClient},
    transport::{PeerService, PeerTransport},
    NodeId, Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// One-way delay applied to every simulated message.
#[derive(Debug, Clone, Copy)]
pub struct LatencySimulator {
    pub min_us: u64,
    pub max_us: u64,
}

impl Default for LatencySimulator {
    fn default() -> Self {
        Self {
            min_us: 500,
            max_us: 3_000,
        }
    }
}

impl LatencySimulator {
    pub fn none() -> Self {
        Self { min_us: 0, max_us: 0 }
    }

    pub async fn simulate(&self) {
        if self.max_us == 0 {
            return;
        }
        let us = rand::thread_rng().gen_range(self.min_us..=self.max_us.max(self.min_us));
        sleep(Duration::from_micros(us)).await;
    }
}

/// Routes RPCs between registered nodes. Every message is encoded to bytes
/// and decoded on arrival. Cut links drop requests and replies alike.
#[derive(Debug)]
pub struct NetworkSimulator {
    services: DashMap<NodeId, Arc<dyn PeerService>>,
    cut: RwLock<HashSet<(NodeId, NodeId)>>,
    latency: LatencySimulator,
}

impl NetworkSimulator {
    pub fn new(latency: LatencySimulator) -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
            cut: RwLock::new(HashSet::new()),
            latency,
        })
    }

    pub fn register(&self, node: NodeId, service: Arc<dyn PeerService>) {
        self.services.insert(node, service);
    }

    /// Simulates a crash: the node stops answering.
    pub fn unregister(&self, node: NodeId) {
        self.services.remove(&node);
    }

    pub fn transport(self: &Arc<Self>, from: NodeId) -> Arc<SimTransport> {
        Arc::new(SimTransport {
            network: self.clone(),
            from,
        })
    }

    /// Cuts every link between the two groups, in both directions.
    pub fn partition(&self, a: &[NodeId], b: &[NodeId]) {
        let mut cut = self.cut.write();
        for &x in a {
            for &y in b {
                cut.insert((x, y));
                cut.insert((y, x));
            }
        }
    }

    /// Cuts `node` off from everyone in `others`.
    pub fn isolate(&self, node: NodeId, others: &[NodeId]) {
        self.partition(&[node], others);
    }

    pub fn heal(&self) {
        self.cut.write().clear();
    }

    pub fn is_cut(&self, from: NodeId, to: NodeId) -> bool {
        self.cut.read().contains(&(from, to))
    }

    async fn deliver(&self, from: NodeId, to: NodeId, message: Message) -> Result<Message> {
        let unreachable = || Error::PeerUnreachable { peer: to };
        if self.is_cut(from, to) {
            return Err(unreachable());
        }
        let frame = message.encode()?;
        self.latency.simulate().await;

        let service = self
            .services
            .get(&to)
            .map(|entry| entry.value().clone())
            .ok_or_else(unreachable)?;
        let reply = match Message::decode(&frame)? {
            Message::VoteRequest(request) => Message::VoteResponse(
                service.on_request_vote(request).await.map_err(|_| unreachable())?,
            ),
            Message::Heartbeat(heartbeat) => Message::HeartbeatAck(
                service.on_heartbeat(heartbeat).await.map_err(|_| unreachable())?,
            ),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "{other:?} is a reply, not a request"
                )))
            }
        };

        let frame = reply.encode()?;
        self.latency.simulate().await;
        if self.is_cut(to, from) {
            return Err(unreachable());
        }
        Message::decode(&frame)
    }
}

/// A node's outbound view of the [`NetworkSimulator`].
#[derive(Debug, Clone)]
pub struct SimTransport {
    network: Arc<NetworkSimulator>,
    from: NodeId,
}

#[async_trait]
impl PeerTransport for SimTransport {
    async fn request_vote(&self, to: NodeId, request: VoteRequest) -> Result<VoteResponse> {
        match self
            .network
            .deliver(self.from, to, Message::VoteRequest(request))
            .await?
        {
            Message::VoteResponse(response) => Ok(response),
            other => Err(Error::InvalidArgument(format!("unexpected reply {other:?}"))),
        }
    }

    async fn heartbeat(&self, to: NodeId, heartbeat: Heartbeat) -> Result<HeartbeatAck> {
        match self
            .network
            .deliver(self.from, to, Message::Heartbeat(heartbeat))
            .await?
        {
            Message::HeartbeatAck(ack) => Ok(ack),
            other => Err(Error::InvalidArgument(format!("unexpected reply {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LostReply {
    delay: Duration,
    failed_reads: usize,
}

/// A store whose writes land but whose replies can go missing. Wraps a
/// [`MemoryStore`]; faults are armed per key and fire once.
#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    lost_replies: DashMap<String, LostReply>,
    failed_reads: DashMap<String, usize>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            lost_replies: DashMap::new(),
            failed_reads: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    /// The next compare-and-swap on `key` is applied, then its reply is held
    /// for `delay`, and the `failed_reads` reads of `key` after it fail.
    pub fn lose_next_reply(&self, key: &str, delay: Duration, failed_reads: usize) {
        self.lost_replies.insert(
            key.to_string(),
            LostReply {
                delay,
                failed_reads,
            },
        );
    }
}

#[async_trait]
impl LeaseStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Snapshot> {
        if let Some(mut left) = self.failed_reads.get_mut(key) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::unavailable(key, "read lost"));
            }
        }
        self.inner.get(key).await
    }

    async fn compare_and_swap(&self, key: &str, request: CasRequest) -> Result<CasOutcome> {
        let outcome = self.inner.compare_and_swap(key, request).await?;
        if let Some((_, lost)) = self.lost_replies.remove(key) {
            self.failed_reads.insert(key.to_string(), lost.failed_reads);
            sleep(lost.delay).await;
        }
        Ok(outcome)
    }
}

/// Election timings tuned for simulated clusters.
pub fn test_election_config(cluster_size: usize) -> ElectionConfig {
    ElectionConfig {
        cluster: "test".to_string(),
        cluster_size,
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        heartbeat_interval_ms: 30,
        rpc_timeout_ms: 60,
        lease_ttl_ms: 600,
    }
}

pub struct TestCluster {
    pub network: Arc<NetworkSimulator>,
    pub store: Arc<MemoryStore>,
    pub leases: Arc<LeaseManager>,
    pub config: ElectionConfig,
    pub nodes: Vec<ElectionHandle>,
}

impl TestCluster {
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(ElectionHandle::node_id).collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&ElectionHandle> {
        self.nodes.iter().find(|n| n.node_id() == id)
    }

    /// Nodes currently reporting [`LeadershipState::Leader`].
    pub fn leaders(&self) -> Vec<(NodeId, LeadershipState)> {
        self.nodes
            .iter()
            .map(|n| (n.node_id(), n.state()))
            .filter(|(_, state)| state.is_leader())
            .collect()
    }

    /// Polls until exactly one node of `among` leads, or `timeout` passes.
    pub async fn wait_for_leader(&self, among: &[NodeId], timeout: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let leaders: Vec<NodeId> = self
                .leaders()
                .into_iter()
                .map(|(id, _)| id)
                .filter(|id| among.contains(id))
                .collect();
            if let [leader] = leaders.as_slice() {
                return Some(*leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

/// Starts `size` election nodes that all see each other through one
/// simulated network and share one in-memory store.
pub fn create_test_cluster(size: usize, latency: LatencySimulator) -> Result<TestCluster> {
    let network = NetworkSimulator::new(latency);
    let store = Arc::new(MemoryStore::new());
    let leases = Arc::new(LeaseManager::new(StoreClient::new(
        store.clone(),
        Duration::from_millis(200),
    )));
    let config = test_election_config(size);

    let ids: Vec<NodeId> = (0..size).map(|_| NodeId::new()).collect();
    let mut nodes = Vec::with_capacity(size);
    for &id in &ids {
        let peers = ids.iter().copied().filter(|p| *p != id).collect();
        let transport = network.transport(id);
        let handle = election::start(config.clone(), id, peers, transport, leases.clone())?;
        network.register(id, Arc::new(handle.clone()));
        nodes.push(handle);
    }

    Ok(TestCluster {
        network,
        store,
        leases,
        config,
        nodes,
    })
}
