use crate::{
    config::CoordinatorConfig,
    election::{self, ElectionHandle, LeadershipState},
    error::Error,
    lease::LeaseManager,
    lockset::{GuardedOutcome, InDoubtPolicy, LockHandle, OrderedLockSet},
    store::{LeaseStore, StoreClient},
    time::Timestamp,
    transport::PeerTransport,
    FencingToken, NodeId, Result,
};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// One node's entry point: multi-key locks over the shared store and,
/// optionally, a seat in the leader election.
#[derive(Debug, Clone)]
pub struct Coordinator {
    node_id: NodeId,
    leases: Arc<LeaseManager>,
    locks: OrderedLockSet,
    election: Option<ElectionHandle>,
}

impl Coordinator {
    /// Locks only; [`is_leader`](Self::is_leader) stays false.
    pub fn new(config: CoordinatorConfig, store: Arc<dyn LeaseStore>) -> Result<Self> {
        config.validate()?;
        let node_id = config.node_id.unwrap_or_default();
        let leases = Arc::new(
            LeaseManager::new(StoreClient::new(store, config.store.op_timeout()))
                .with_retry(config.retry),
        );
        info!(node = %node_id, "coordinator started");
        Ok(Self {
            node_id,
            locks: OrderedLockSet::new(leases.clone(), node_id),
            leases,
            election: None,
        })
    }

    /// Locks plus election among `config.peers`, reached through `transport`.
    /// Register [`election`](Self::election) with the transport's inbound side
    /// so peers can reach this node.
    pub fn with_election(
        config: CoordinatorConfig,
        store: Arc<dyn LeaseStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        let election_config = config.election.clone();
        let peers = config.peers.clone();
        let mut coordinator = Self::new(config, store)?;
        let handle = election::start(
            election_config,
            coordinator.node_id,
            peers,
            transport,
            coordinator.leases.clone(),
        )?;
        coordinator.election = Some(handle);
        Ok(coordinator)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn locks(&self) -> &OrderedLockSet {
        &self.locks
    }

    pub fn election(&self) -> Option<&ElectionHandle> {
        self.election.as_ref()
    }

    pub async fn acquire_lock<K: AsRef<str>>(
        &self,
        keys: &[K],
        ttl: Duration,
    ) -> Result<LockHandle> {
        self.locks.acquire_all(keys, ttl).await
    }

    pub async fn acquire_lock_timeout<K: AsRef<str>>(
        &self,
        keys: &[K],
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockHandle> {
        self.locks.acquire_all_timeout(keys, ttl, wait).await
    }

    pub async fn renew_lock(&self, handle: &mut LockHandle) -> Result<Timestamp> {
        self.locks.renew(handle).await
    }

    pub async fn release_lock(&self, handle: LockHandle) -> Result<()> {
        self.locks.release(handle).await
    }

    pub async fn run_guarded<K, F, Fut, T>(
        &self,
        keys: &[K],
        ttl: Duration,
        policy: InDoubtPolicy,
        work: F,
    ) -> Result<GuardedOutcome<T>>
    where
        K: AsRef<str>,
        F: FnOnce(BTreeMap<String, FencingToken>) -> Fut,
        Fut: Future<Output = T>,
    {
        self.locks.run_guarded(keys, ttl, policy, work).await
    }

    pub fn is_leader(&self) -> bool {
        self.election.as_ref().is_some_and(ElectionHandle::is_leader)
    }

    pub fn fencing_token(&self) -> Option<FencingToken> {
        self.election.as_ref().and_then(ElectionHandle::fencing_token)
    }

    pub fn leadership(&self) -> Option<LeadershipState> {
        self.election.as_ref().map(ElectionHandle::state)
    }

    pub fn on_leadership_change<F>(&self, callback: F) -> Result<JoinHandle<()>>
    where
        F: Fn(LeadershipState) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let election = self.election.as_ref().ok_or(Error::NoElection)?;
        Ok(election.on_leadership_change(callback))
    }

    pub async fn step_down(&self) -> Result<()> {
        self.election.as_ref().ok_or(Error::NoElection)?.step_down().await
    }

    /// Leaves the election, releasing leadership if held. Locks taken through
    /// this coordinator are the caller's to release.
    pub async fn shutdown(&self) {
        if let Some(election) = &self.election {
            election.shutdown().await;
        }
        info!(node = %self.node_id, "coordinator stopped");
    }
}
