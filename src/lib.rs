//! Leases with fencing tokens, deadlock-free multi-key locks and quorum
//! leader election over a linearizable compare-and-swap store.
//!
//! - [`lease::LeaseManager`] grants time-bounded leases whose tokens strictly
//!   increase per key.
//! - [`lockset::OrderedLockSet`] takes several leases in one canonical order.
//! - [`election::ElectionHandle`] runs vote-based leader election and binds
//!   leadership to a lease token.
//! - [`fencing::FencingValidator`] sits next to a protected resource and
//!   rejects operations carrying superseded tokens.
//! - [`coordinator::Coordinator`] bundles all of the above for one node.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod fencing;
pub mod lease;
pub mod lockset;
pub mod message;
pub mod node;
pub mod retry;
pub mod store;
pub mod time;
pub mod transport;

pub mod test_utils;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use election::{ElectionHandle, LeadershipState};
pub use error::{Error, ErrorKind, Result};
pub use fencing::FencingValidator;
pub use lease::{Lease, LeaseManager};
pub use lockset::{GuardedOutcome, InDoubtPolicy, LockHandle, OrderedLockSet};
pub use store::{LeaseStore, MemoryStore, StoreClient};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Election epoch. Strictly increasing across elections.
pub type Term = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub uuid::Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first 8 hex digits are plenty to tell nodes apart in logs
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Proof of lease or leadership currency. Resources reject any operation
/// bearing a token lower than one they have already accepted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FencingToken(pub u64);

impl FencingToken {
    /// Token of a key that has never been leased.
    pub const ZERO: FencingToken = FencingToken(0);

    pub fn value(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Votes required for a binding decision among `cluster_size` voters.
pub fn quorum(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}
