use crate::{
    message::{Heartbeat, HeartbeatAck, VoteRequest, VoteResponse},
    NodeId, Result,
};
use async_trait::async_trait;

/// Outbound RPCs from one node to its peers. Implementations time out on
/// their own; the election loop also bounds every call with `rpc_timeout`.
#[async_trait]
pub trait PeerTransport: Send + Sync + std::fmt::Debug {
    async fn request_vote(&self, to: NodeId, request: VoteRequest) -> Result<VoteResponse>;
    async fn heartbeat(&self, to: NodeId, heartbeat: Heartbeat) -> Result<HeartbeatAck>;
}

/// Inbound side: what a transport calls when a peer's RPC arrives.
#[async_trait]
pub trait PeerService: Send + Sync + std::fmt::Debug {
    async fn on_request_vote(&self, request: VoteRequest) -> Result<VoteResponse>;
    async fn on_heartbeat(&self, heartbeat: Heartbeat) -> Result<HeartbeatAck>;
}
