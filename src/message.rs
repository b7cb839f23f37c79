use crate::{FencingToken, NodeId, Result, Term};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Wire format for peer-to-peer election traffic. Lease traffic goes to the
/// store and never travels between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Responder's term after handling the request.
    pub term: Term,
    pub voter: NodeId,
    pub granted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub term: Term,
    pub leader: NodeId,
    /// Token of the leadership lease, once the leader holds it.
    pub fencing_token: Option<FencingToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub term: Term,
    pub from: NodeId,
    /// False when the receiver knows a newer term.
    pub accepted: bool,
}

impl Message {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn term(&self) -> Term {
        match self {
            Message::VoteRequest(m) => m.term,
            Message::VoteResponse(m) => m.term,
            Message::Heartbeat(m) => m.term,
            Message::HeartbeatAck(m) => m.term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_carries_token() {
        let msg = Message::Heartbeat(Heartbeat {
            term: 4,
            leader: NodeId::new(),
            fencing_token: Some(FencingToken(12)),
        });
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.term(), 4);
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let err = Message::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, crate::Error::Serialization(_)));
    }
}
