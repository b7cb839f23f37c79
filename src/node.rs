//! Election state of one node, free of I/O and timers.
//!
//! The election task owns a [`NodeState`] and feeds it every message it
//! receives; this module only decides what the node believes and what it
//! answers.

use crate::{
    message::{Heartbeat, HeartbeatAck, VoteRequest, VoteResponse},
    FencingToken, NodeId, Term,
};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    /// Won the vote for `current_term`. May not yet hold the leadership lease.
    Leader,
}

#[derive(Debug, Clone)]
pub struct NodeState {
    pub id: NodeId,
    pub role: Role,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader: Option<NodeId>,
    /// Highest leadership token seen in a heartbeat.
    pub last_fencing_token: Option<FencingToken>,
}

impl NodeState {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader: None,
            last_fencing_token: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Moves to a fresh term as candidate, voting for itself.
    pub fn start_election(&mut self) -> VoteRequest {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id);
        self.leader = None;
        info!(node = %self.id, term = self.current_term, "starting election");
        VoteRequest {
            term: self.current_term,
            candidate: self.id,
        }
    }

    /// Adopts `term` if it is newer, falling back to follower. Returns true
    /// when that happened.
    pub fn observe_term(&mut self, term: Term) -> bool {
        if term <= self.current_term {
            return false;
        }
        debug!(node = %self.id, from = self.current_term, to = term, "adopting newer term");
        self.current_term = term;
        self.role = Role::Follower;
        self.voted_for = None;
        self.leader = None;
        true
    }

    /// At most one vote per term: granted iff the request is for our current
    /// term (after adopting it) and we have not voted for someone else.
    pub fn handle_vote_request(&mut self, request: &VoteRequest) -> VoteResponse {
        self.observe_term(request.term);

        let granted = request.term == self.current_term
            && self.voted_for.map_or(true, |v| v == request.candidate);
        if granted {
            self.voted_for = Some(request.candidate);
        }
        debug!(
            node = %self.id,
            candidate = %request.candidate,
            term = request.term,
            granted,
            "vote request"
        );
        VoteResponse {
            term: self.current_term,
            voter: self.id,
            granted,
        }
    }

    pub fn handle_heartbeat(&mut self, heartbeat: &Heartbeat) -> HeartbeatAck {
        let stale = heartbeat.term < self.current_term;
        // Two leaders in one term cannot both have a quorum; refuse the other.
        let rival = heartbeat.term == self.current_term
            && self.role == Role::Leader
            && heartbeat.leader != self.id;
        if stale || rival {
            return HeartbeatAck {
                term: self.current_term,
                from: self.id,
                accepted: false,
            };
        }

        self.observe_term(heartbeat.term);
        self.role = Role::Follower;
        self.leader = Some(heartbeat.leader);
        if let Some(token) = heartbeat.fencing_token {
            self.last_fencing_token = Some(self.last_fencing_token.map_or(token, |t| t.max(token)));
        }
        HeartbeatAck {
            term: self.current_term,
            from: self.id,
            accepted: true,
        }
    }

    /// Promotes a candidate that won `term`. Refused if the node has moved on
    /// since the election started.
    pub fn become_leader(&mut self, term: Term) -> bool {
        if self.role != Role::Candidate || self.current_term != term {
            return false;
        }
        self.role = Role::Leader;
        self.leader = Some(self.id);
        info!(node = %self.id, term, "won election");
        true
    }

    /// Back to follower in the same term, keeping the vote already cast.
    pub fn step_down(&mut self) {
        if self.role != Role::Follower {
            info!(node = %self.id, term = self.current_term, "stepping down");
        }
        self.role = Role::Follower;
        if self.leader == Some(self.id) {
            self.leader = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyResult {
    Won,
    Lost,
    Pending,
}

/// Votes collected by a candidate for one term. Only real responses count.
#[derive(Debug, Clone)]
pub struct VoteTally {
    term: Term,
    quorum: usize,
    peers: usize,
    granted: HashSet<NodeId>,
    responded: HashSet<NodeId>,
}

impl VoteTally {
    /// Starts with the candidate's own vote.
    pub fn new(candidate: NodeId, term: Term, quorum: usize, peers: usize) -> Self {
        let mut granted = HashSet::new();
        granted.insert(candidate);
        Self {
            term,
            quorum,
            peers,
            granted,
            responded: HashSet::new(),
        }
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn votes(&self) -> usize {
        self.granted.len()
    }

    pub fn record(&mut self, response: &VoteResponse) -> TallyResult {
        if response.term == self.term && self.responded.insert(response.voter) && response.granted {
            self.granted.insert(response.voter);
        }
        self.result()
    }

    /// A peer that could not be reached; counts as a refusal.
    pub fn record_failure(&mut self, peer: NodeId) -> TallyResult {
        self.responded.insert(peer);
        self.result()
    }

    pub fn result(&self) -> TallyResult {
        if self.granted.len() >= self.quorum {
            TallyResult::Won
        } else if self.responded.len() >= self.peers {
            TallyResult::Lost
        } else {
            TallyResult::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_vote_per_term() {
        let mut voter = NodeState::new(NodeId::new());
        let a = NodeId::new();
        let b = NodeId::new();

        let yes = voter.handle_vote_request(&VoteRequest { term: 1, candidate: a });
        assert!(yes.granted);
        // repeated request from the same candidate is still granted
        assert!(voter.handle_vote_request(&VoteRequest { term: 1, candidate: a }).granted);
        assert!(!voter.handle_vote_request(&VoteRequest { term: 1, candidate: b }).granted);
        // a newer term resets the vote
        assert!(voter.handle_vote_request(&VoteRequest { term: 2, candidate: b }).granted);
    }

    #[test]
    fn test_stale_vote_request_refused() {
        let mut voter = NodeState::new(NodeId::new());
        voter.observe_term(5);
        let resp = voter.handle_vote_request(&VoteRequest {
            term: 4,
            candidate: NodeId::new(),
        });
        assert!(!resp.granted);
        assert_eq!(resp.term, 5);
    }

    #[test]
    fn test_higher_term_demotes_leader() {
        let mut node = NodeState::new(NodeId::new());
        let req = node.start_election();
        assert!(node.become_leader(req.term));
        assert!(node.is_leader());

        let ack = node.handle_heartbeat(&Heartbeat {
            term: req.term + 1,
            leader: NodeId::new(),
            fencing_token: Some(FencingToken(3)),
        });
        assert!(ack.accepted);
        assert_eq!(node.role, Role::Follower);
        assert_eq!(node.last_fencing_token, Some(FencingToken(3)));
    }

    #[test]
    fn test_heartbeat_rejections() {
        let mut node = NodeState::new(NodeId::new());
        node.observe_term(3);
        let stale = node.handle_heartbeat(&Heartbeat {
            term: 2,
            leader: NodeId::new(),
            fencing_token: None,
        });
        assert!(!stale.accepted);

        let req = node.start_election();
        assert!(node.become_leader(req.term));
        let rival = node.handle_heartbeat(&Heartbeat {
            term: req.term,
            leader: NodeId::new(),
            fencing_token: None,
        });
        assert!(!rival.accepted);
        assert!(node.is_leader());
    }

    #[test]
    fn test_become_leader_requires_current_candidacy() {
        let mut node = NodeState::new(NodeId::new());
        let req = node.start_election();
        node.observe_term(req.term + 1);
        assert!(!node.become_leader(req.term));
    }

    #[test]
    fn test_tally_counts_each_voter_once() {
        let me = NodeId::new();
        let peer = NodeId::new();
        let mut tally = VoteTally::new(me, 1, 3, 4);
        let yes = VoteResponse {
            term: 1,
            voter: peer,
            granted: true,
        };
        assert_eq!(tally.record(&yes), TallyResult::Pending);
        assert_eq!(tally.record(&yes), TallyResult::Pending);
        assert_eq!(tally.votes(), 2);

        // wrong term is ignored
        let other = NodeId::new();
        tally.record(&VoteResponse {
            term: 0,
            voter: other,
            granted: true,
        });
        assert_eq!(tally.votes(), 2);

        assert_eq!(
            tally.record(&VoteResponse {
                term: 1,
                voter: other,
                granted: true,
            }),
            TallyResult::Won
        );
    }

    #[test]
    fn test_tally_lost_when_everyone_answered() {
        let mut tally = VoteTally::new(NodeId::new(), 1, 2, 2);
        tally.record_failure(NodeId::new());
        assert_eq!(
            tally.record(&VoteResponse {
                term: 1,
                voter: NodeId::new(),
                granted: false,
            }),
            TallyResult::Lost
        );
    }

    #[test]
    fn test_single_node_wins_alone() {
        let tally = VoteTally::new(NodeId::new(), 1, 1, 0);
        assert_eq!(tally.result(), TallyResult::Won);
    }
}
