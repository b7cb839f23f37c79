use crate::{time::Timestamp, FencingToken, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Lease conflict: {key:?} is held by {holder:?}")]
    Conflict {
        key: String,
        holder: Option<NodeId>,
        expires_at: Option<Timestamp>,
    },

    #[error("Not holder: {holder} does not hold {key:?}")]
    NotHolder { key: String, holder: NodeId },

    #[error("Token mismatch on {key:?}: presented {presented}, store has {current}")]
    TokenMismatch {
        key: String,
        presented: FencingToken,
        current: FencingToken,
    },

    #[error("Lease expired for {key:?} at {expires_at}")]
    Expired { key: String, expires_at: Timestamp },

    #[error("Stale token for {key:?}: {presented} is older than {last_accepted}")]
    StaleToken {
        key: String,
        presented: FencingToken,
        last_accepted: FencingToken,
    },

    #[error("Lock lost on {key:?}: {source}")]
    LockLost {
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Store unavailable for {key:?}: {reason}")]
    StoreUnavailable { key: String, reason: String },

    #[error("RPC to {peer} timed out")]
    RpcTimeout { peer: NodeId },

    #[error("Peer {peer} unreachable")]
    PeerUnreachable { peer: NodeId },

    #[error("Cluster below quorum: {available} voters configured, {quorum} required")]
    ClusterBelowQuorum { available: usize, quorum: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Node is not participating in leader election")]
    NoElection,

    #[error("Election coordinator has shut down")]
    Shutdown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a caller should react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Nothing changed; retry with backoff.
    Transient,
    /// Ownership moved on; re-acquire from scratch, never retry the same call.
    Conflict,
    /// Operator attention needed.
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::StoreUnavailable { .. }
            | Error::RpcTimeout { .. }
            | Error::PeerUnreachable { .. } => ErrorKind::Transient,
            Error::Conflict { .. }
            | Error::NotHolder { .. }
            | Error::TokenMismatch { .. }
            | Error::Expired { .. }
            | Error::StaleToken { .. }
            | Error::LockLost { .. } => ErrorKind::Conflict,
            Error::ClusterBelowQuorum { .. }
            | Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::NoElection
            | Error::Shutdown
            | Error::Serialization(_)
            | Error::ConfigParse(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// True when the caller's lease is definitely gone: it expired or was
    /// taken over. Leaders step down on these.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            Error::Expired { .. } | Error::TokenMismatch { .. } | Error::NotHolder { .. }
        )
    }

    pub(crate) fn unavailable(key: &str, reason: impl Into<String>) -> Self {
        Error::StoreUnavailable {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
