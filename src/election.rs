//! Quorum leader election bound to a leadership lease.
//!
//! One task per node owns the [`NodeState`] and every piece of election
//! state. Inbound RPCs, vote and ack results from fan-out tasks, lease results
//! and operator commands all arrive on one channel and are applied in order.
//!
//! Winning the vote only makes a node [`LeadershipState::Elected`]. It becomes
//! [`LeadershipState::Leader`] once it holds the `leader:<cluster>` lease, and
//! the lease token is the fencing token its leader actions must carry.

use crate::{
    config::ElectionConfig,
    error::Error,
    lease::{Lease, LeaseManager},
    message::{Heartbeat, HeartbeatAck, VoteRequest, VoteResponse},
    node::{NodeState, Role, TallyResult, VoteTally},
    quorum,
    time::Timestamp,
    transport::{PeerService, PeerTransport},
    FencingToken, NodeId, Result, Term,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipState {
    Follower { term: Term, leader: Option<NodeId> },
    Candidate { term: Term },
    /// Won the vote, still acquiring the leadership lease.
    Elected { term: Term },
    Leader { term: Term, fencing_token: FencingToken },
    /// The election task has shut down.
    Stopped,
}

impl LeadershipState {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipState::Leader { .. })
    }

    pub fn fencing_token(&self) -> Option<FencingToken> {
        match self {
            LeadershipState::Leader { fencing_token, .. } => Some(*fencing_token),
            _ => None,
        }
    }

    pub fn term(&self) -> Option<Term> {
        match self {
            LeadershipState::Follower { term, .. }
            | LeadershipState::Candidate { term }
            | LeadershipState::Elected { term }
            | LeadershipState::Leader { term, .. } => Some(*term),
            LeadershipState::Stopped => None,
        }
    }
}

enum Event {
    RequestVote {
        request: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    Heartbeat {
        heartbeat: Heartbeat,
        reply: oneshot::Sender<HeartbeatAck>,
    },
    VoteReply {
        term: Term,
        peer: NodeId,
        result: Result<VoteResponse>,
    },
    AckReply {
        term: Term,
        peer: NodeId,
        result: Result<HeartbeatAck>,
    },
    LeaseAcquired {
        term: Term,
        sent_at: Instant,
        result: Result<Lease>,
    },
    LeaseRenewed {
        token: FencingToken,
        sent_at: Instant,
        result: Result<Timestamp>,
    },
    StepDown {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running election. Cheap to clone; every clone talks to the
/// same task. Also the [`PeerService`] a transport dispatches inbound RPCs to.
#[derive(Debug, Clone)]
pub struct ElectionHandle {
    node_id: NodeId,
    events: mpsc::UnboundedSender<Event>,
    state_rx: watch::Receiver<LeadershipState>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Event::RequestVote { .. } => "RequestVote",
            Event::Heartbeat { .. } => "Heartbeat",
            Event::VoteReply { .. } => "VoteReply",
            Event::AckReply { .. } => "AckReply",
            Event::LeaseAcquired { .. } => "LeaseAcquired",
            Event::LeaseRenewed { .. } => "LeaseRenewed",
            Event::StepDown { .. } => "StepDown",
            Event::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Starts participating in the election for `config.cluster`. `peers` are the
/// other voters; they are reached through `transport` and the leadership lease
/// through `leases`.
pub fn start(
    config: ElectionConfig,
    node_id: NodeId,
    peers: Vec<NodeId>,
    transport: Arc<dyn PeerTransport>,
    leases: Arc<LeaseManager>,
) -> Result<ElectionHandle> {
    config.validate()?;
    let mut unique = HashSet::new();
    if peers.iter().any(|p| *p == node_id || !unique.insert(*p)) {
        return Err(Error::InvalidConfig(
            "peers must be distinct and exclude this node".into(),
        ));
    }
    let members = peers.len() + 1;
    if members > config.cluster_size {
        return Err(Error::InvalidConfig(format!(
            "{members} members configured but cluster_size is {}",
            config.cluster_size
        )));
    }
    let needed = quorum(config.cluster_size);
    if members < needed {
        return Err(Error::ClusterBelowQuorum {
            available: members,
            quorum: needed,
        });
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let state = NodeState::new(node_id);
    let (state_tx, state_rx) = watch::channel(LeadershipState::Follower {
        term: state.current_term,
        leader: None,
    });

    let now = Instant::now();
    let mut election = Election {
        lease_key: config.lease_key(),
        quorum: needed,
        config,
        state,
        peers,
        transport,
        leases,
        events: events_tx.clone(),
        state_tx,
        tally: None,
        election_deadline: now,
        next_heartbeat: now,
        lease: None,
        lease_id: Uuid::new_v4(),
        lease_pending: false,
        acks: HashSet::new(),
        ack_window_start: now,
    };
    election.reset_election_timer(now);
    info!(
        node = %node_id,
        cluster = %election.config.cluster,
        peers = election.peers.len(),
        "joining election"
    );

    let task = tokio::spawn(election.run(events_rx));
    Ok(ElectionHandle {
        node_id,
        events: events_tx,
        state_rx,
        task: Arc::new(Mutex::new(Some(task))),
    })
}

impl ElectionHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> LeadershipState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_rx.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state_rx.borrow().is_leader()
    }

    /// Token of the leadership lease, present only while leader.
    pub fn fencing_token(&self) -> Option<FencingToken> {
        self.state_rx.borrow().fencing_token()
    }

    /// Calls `callback` each time this node gains or loses leadership, until
    /// the election stops. Callbacks run one at a time in a dedicated task.
    pub fn on_leadership_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(LeadershipState) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let mut rx = self.state_rx.clone();
        tokio::spawn(async move {
            let mut last = {
                let state = rx.borrow_and_update();
                (state.is_leader(), state.fencing_token())
            };
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                let current = (state.is_leader(), state.fencing_token());
                if current != last {
                    last = current;
                    callback(state.clone()).await;
                }
                if state == LeadershipState::Stopped {
                    break;
                }
            }
        })
    }

    /// Gives up leadership and releases the leadership lease. A no-op for a
    /// node that is not leading.
    pub async fn step_down(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.events
            .send(Event::StepDown { done })
            .map_err(|_| Error::Shutdown)?;
        wait.await.map_err(|_| Error::Shutdown)
    }

    /// Steps down if leading and stops the election task. Safe to call from
    /// several clones; later calls return once the task is gone.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.events.send(Event::Shutdown { done }).is_ok() {
            let _ = wait.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(node = %self.node_id, error = %err, "election task ended abnormally");
            }
        }
    }
}

#[async_trait]
impl PeerService for ElectionHandle {
    async fn on_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(Event::RequestVote { request, reply })
            .map_err(|_| Error::Shutdown)?;
        response.await.map_err(|_| Error::Shutdown)
    }

    async fn on_heartbeat(&self, heartbeat: Heartbeat) -> Result<HeartbeatAck> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(Event::Heartbeat { heartbeat, reply })
            .map_err(|_| Error::Shutdown)?;
        response.await.map_err(|_| Error::Shutdown)
    }
}

#[derive(Debug, Clone, Copy)]
struct LeaderLease {
    token: FencingToken,
    /// Local bound on validity: send time of the last confirmed write plus ttl.
    deadline: Instant,
}

struct Election {
    config: ElectionConfig,
    lease_key: String,
    quorum: usize,
    state: NodeState,
    peers: Vec<NodeId>,
    transport: Arc<dyn PeerTransport>,
    leases: Arc<LeaseManager>,
    events: mpsc::UnboundedSender<Event>,
    state_tx: watch::Sender<LeadershipState>,
    tally: Option<VoteTally>,
    election_deadline: Instant,
    next_heartbeat: Instant,
    lease: Option<LeaderLease>,
    /// Grant id for this term's acquire attempts.
    lease_id: Uuid,
    lease_pending: bool,
    /// Peers that acked a heartbeat in the current check-quorum window.
    acks: HashSet<NodeId>,
    ack_window_start: Instant,
}

impl Election {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        loop {
            let wake = if self.state.is_leader() {
                self.next_heartbeat
            } else {
                self.election_deadline
            };
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let ControlFlow::Break(done) = self.handle(event) {
                            self.stop().await;
                            let _ = done.send(());
                            return;
                        }
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(wake) => self.on_timer(),
            }
        }
        self.stop().await;
    }

    /// Applies one event. Breaks with the caller's completion signal when the
    /// event asks the task to stop.
    fn handle(&mut self, event: Event) -> ControlFlow<oneshot::Sender<()>> {
        trace!(node = %self.state.id, ?event, "election event");
        let now = Instant::now();
        let was_leader = self.state.is_leader();
        match event {
            Event::RequestVote { request, reply } => {
                let response = self.state.handle_vote_request(&request);
                if response.granted {
                    self.reset_election_timer(now);
                }
                self.settle(was_leader);
                let _ = reply.send(response);
            }
            Event::Heartbeat { heartbeat, reply } => {
                let ack = self.state.handle_heartbeat(&heartbeat);
                if ack.accepted {
                    self.reset_election_timer(now);
                }
                self.settle(was_leader);
                let _ = reply.send(ack);
            }
            Event::VoteReply { term, peer, result } => self.on_vote_reply(term, peer, result),
            Event::AckReply { term, peer, result } => match result {
                Ok(ack) => {
                    if self.state.observe_term(ack.term) {
                        self.settle(was_leader);
                    } else if ack.accepted && was_leader && term == self.state.current_term {
                        self.acks.insert(peer);
                    }
                }
                Err(err) => {
                    trace!(node = %self.state.id, %peer, error = %err, "heartbeat not delivered");
                }
            },
            Event::LeaseAcquired {
                term,
                sent_at,
                result,
            } => self.on_lease_acquired(term, sent_at, result),
            Event::LeaseRenewed {
                token,
                sent_at,
                result,
            } => self.on_lease_renewed(token, sent_at, result),
            Event::StepDown { done } => {
                if was_leader {
                    self.relinquish("step-down requested");
                }
                let _ = done.send(());
            }
            Event::Shutdown { done } => return ControlFlow::Break(done),
        }
        ControlFlow::Continue(())
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if self.state.is_leader() {
            self.leader_tick(now);
        } else {
            self.start_election(now);
        }
    }

    fn start_election(&mut self, now: Instant) {
        let request = self.state.start_election();
        self.reset_election_timer(now);

        let tally = VoteTally::new(self.state.id, request.term, self.quorum, self.peers.len());
        if tally.result() == TallyResult::Won {
            self.win(request.term, now);
            return;
        }
        self.tally = Some(tally);
        self.publish();

        for &peer in &self.peers {
            let transport = self.transport.clone();
            let events = self.events.clone();
            let rpc_timeout = self.config.rpc_timeout();
            tokio::spawn(async move {
                let reply =
                    tokio::time::timeout(rpc_timeout, transport.request_vote(peer, request));
                let result = match reply.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::RpcTimeout { peer }),
                };
                let _ = events.send(Event::VoteReply {
                    term: request.term,
                    peer,
                    result,
                });
            });
        }
    }

    fn on_vote_reply(&mut self, term: Term, peer: NodeId, result: Result<VoteResponse>) {
        let was_leader = self.state.is_leader();
        if let Ok(response) = &result {
            if self.state.observe_term(response.term) {
                self.settle(was_leader);
                return;
            }
        }
        if self.state.role != Role::Candidate || self.state.current_term != term {
            return;
        }
        let Some(tally) = self.tally.as_mut().filter(|t| t.term() == term) else {
            return;
        };

        let outcome = match &result {
            Ok(response) => tally.record(response),
            Err(err) => {
                debug!(node = %self.state.id, %peer, error = %err, "vote request failed");
                tally.record_failure(peer)
            }
        };
        match outcome {
            TallyResult::Won => self.win(term, Instant::now()),
            TallyResult::Lost => {
                debug!(node = %self.state.id, term, votes = tally.votes(), "election lost");
                self.tally = None;
                self.state.step_down();
                self.publish();
            }
            TallyResult::Pending => {}
        }
    }

    fn win(&mut self, term: Term, now: Instant) {
        if !self.state.become_leader(term) {
            return;
        }
        self.tally = None;
        self.lease = None;
        self.lease_id = Uuid::new_v4();
        self.acks.clear();
        self.ack_window_start = now;
        self.next_heartbeat = now;
        self.publish();
    }

    fn leader_tick(&mut self, now: Instant) {
        self.next_heartbeat = now + self.config.heartbeat_interval();

        if now.duration_since(self.ack_window_start) >= self.config.election_timeout_max() {
            if self.acks.len() + 1 < self.quorum {
                self.relinquish("lost contact with a quorum");
                return;
            }
            self.acks.clear();
            self.ack_window_start = now;
        }
        // A tick early, so we are gone before the store can hand the lease on.
        let horizon = now + self.config.heartbeat_interval();
        if self.lease.is_some_and(|lease| horizon >= lease.deadline) {
            self.relinquish("leadership lease deadline passed");
            return;
        }

        self.broadcast_heartbeat();
        self.drive_lease(now);
    }

    fn broadcast_heartbeat(&self) {
        let heartbeat = Heartbeat {
            term: self.state.current_term,
            leader: self.state.id,
            fencing_token: self.lease.map(|lease| lease.token),
        };
        for &peer in &self.peers {
            let transport = self.transport.clone();
            let events = self.events.clone();
            let rpc_timeout = self.config.rpc_timeout();
            tokio::spawn(async move {
                let reply = tokio::time::timeout(rpc_timeout, transport.heartbeat(peer, heartbeat));
                let result = match reply.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::RpcTimeout { peer }),
                };
                let _ = events.send(Event::AckReply {
                    term: heartbeat.term,
                    peer,
                    result,
                });
            });
        }
    }

    /// Acquires the leadership lease, or renews it once held. One store call
    /// in flight at a time.
    fn drive_lease(&mut self, now: Instant) {
        if self.lease_pending {
            return;
        }
        self.lease_pending = true;

        let leases = self.leases.clone();
        let events = self.events.clone();
        let key = self.lease_key.clone();
        let holder = self.state.id;
        let ttl = self.config.lease_ttl();
        match self.lease {
            Some(lease) => {
                tokio::spawn(async move {
                    let result = leases.renew(&key, holder, lease.token, ttl).await;
                    let _ = events.send(Event::LeaseRenewed {
                        token: lease.token,
                        sent_at: now,
                        result,
                    });
                });
            }
            None => {
                let term = self.state.current_term;
                let lease_id = self.lease_id;
                tokio::spawn(async move {
                    let result = leases.acquire_as(&key, holder, ttl, lease_id).await;
                    let _ = events.send(Event::LeaseAcquired {
                        term,
                        sent_at: now,
                        result,
                    });
                });
            }
        }
    }

    fn on_lease_acquired(&mut self, term: Term, sent_at: Instant, result: Result<Lease>) {
        self.lease_pending = false;
        let wanted =
            self.state.is_leader() && self.state.current_term == term && self.lease.is_none();
        match result {
            Ok(lease) if wanted => {
                info!(
                    node = %self.state.id,
                    term,
                    token = %lease.token,
                    "leadership lease acquired"
                );
                self.lease = Some(LeaderLease {
                    token: lease.token,
                    deadline: sent_at + self.config.lease_ttl(),
                });
                self.publish();
            }
            Ok(lease) => {
                debug!(
                    node = %self.state.id,
                    term,
                    "leadership moved on while acquiring, releasing"
                );
                self.spawn_release(lease.token);
            }
            Err(err) => {
                debug!(
                    node = %self.state.id,
                    term,
                    error = %err,
                    "leadership lease not available yet"
                );
            }
        }
    }

    fn on_lease_renewed(
        &mut self,
        token: FencingToken,
        sent_at: Instant,
        result: Result<Timestamp>,
    ) {
        self.lease_pending = false;
        let ttl = self.config.lease_ttl();
        let Some(lease) = self.lease.as_mut().filter(|l| l.token == token) else {
            return;
        };
        match result {
            Ok(_) => lease.deadline = sent_at + ttl,
            Err(err) if err.is_lease_lost() => {
                warn!(node = %self.state.id, %token, error = %err, "leadership lease lost");
                self.relinquish("leadership lease lost");
            }
            Err(err) => {
                warn!(
                    node = %self.state.id,
                    %token,
                    error = %err,
                    "leadership lease renewal failed"
                );
            }
        }
    }

    /// Called after any handler that may have changed the role.
    fn settle(&mut self, was_leader: bool) {
        if self.state.role != Role::Candidate {
            self.tally = None;
        }
        if was_leader && !self.state.is_leader() {
            warn!(node = %self.state.id, term = self.state.current_term, "deposed by newer term");
            self.release_lease();
            self.reset_election_timer(Instant::now());
        }
        self.publish();
    }

    fn relinquish(&mut self, reason: &str) {
        warn!(node = %self.state.id, term = self.state.current_term, reason, "stepping down");
        self.state.step_down();
        self.release_lease();
        self.reset_election_timer(Instant::now());
        self.publish();
    }

    fn release_lease(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.spawn_release(lease.token);
        }
    }

    fn spawn_release(&self, token: FencingToken) {
        let leases = self.leases.clone();
        let key = self.lease_key.clone();
        let holder = self.state.id;
        tokio::spawn(async move {
            if let Err(err) = leases.release(&key, holder, token).await {
                warn!(
                    %holder,
                    %token,
                    error = %err,
                    "leadership lease release failed, it will expire"
                );
            }
        });
    }

    async fn stop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let released = self
                .leases
                .release(&self.lease_key, self.state.id, lease.token)
                .await;
            if let Err(err) = released {
                warn!(
                    node = %self.state.id,
                    error = %err,
                    "leadership lease release failed on shutdown"
                );
            }
        }
        self.state.step_down();
        info!(node = %self.state.id, "election stopped");
        self.state_tx.send_replace(LeadershipState::Stopped);
    }

    fn reset_election_timer(&mut self, now: Instant) {
        let min = self.config.election_timeout_min();
        let max = self.config.election_timeout_max();
        self.election_deadline = now + rand::thread_rng().gen_range(min..=max);
    }

    fn leadership(&self) -> LeadershipState {
        let term = self.state.current_term;
        match self.state.role {
            Role::Follower => LeadershipState::Follower {
                term,
                leader: self.state.leader,
            },
            Role::Candidate => LeadershipState::Candidate { term },
            Role::Leader => match self.lease {
                Some(lease) => LeadershipState::Leader {
                    term,
                    fencing_token: lease.token,
                },
                None => LeadershipState::Elected { term },
            },
        }
    }

    fn publish(&self) {
        let next = self.leadership();
        let node = self.state.id;
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if next.is_leader() || current.is_leader() {
                info!(%node, from = ?current, to = ?next, "leadership changed");
            } else {
                debug!(%node, from = ?current, to = ?next, "election state changed");
            }
            *current = next;
            true
        });
    }
}
