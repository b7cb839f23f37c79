//! Client side of the external linearizable store.
//!
//! The store exposes two primitives: a read, and a compare-and-swap whose
//! guard is evaluated by the store atomically with the write. Expiry times are
//! stamped by the store's clock, never by the caller.

use crate::{
    error::Error,
    time::{self, Clock, MonotonicClock, Timestamp},
    FencingToken, NodeId, Result,
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub key: String,
    /// `None` once released. The token is kept so it keeps increasing.
    pub holder: Option<NodeId>,
    pub token: FencingToken,
    pub expires_at: Timestamp,
    pub version: u64,
    /// Chosen by the acquirer, so it can tell its own grant apart from one
    /// made by another task under the same holder id.
    pub lease_id: Uuid,
}

impl LeaseRecord {
    pub fn is_live_at(&self, now: Timestamp) -> bool {
        self.holder.is_some() && self.expires_at >= now
    }
}

/// A read, together with the store time it was served at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub record: Option<LeaseRecord>,
    pub observed_at: Timestamp,
}

impl Snapshot {
    pub fn live_record(&self) -> Option<&LeaseRecord> {
        self.record.as_ref().filter(|r| r.is_live_at(self.observed_at))
    }
}

/// Condition the store checks against the current record before writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Version matches (`None` means no record yet) and nobody holds a live lease.
    Vacant { expected_version: Option<u64> },
    /// Holder and token match and the lease has not expired.
    LiveHolder { holder: NodeId, token: FencingToken },
    /// Holder and token match, expired or not.
    Holder { holder: NodeId, token: FencingToken },
}

impl Guard {
    pub fn admits(&self, current: Option<&LeaseRecord>, now: Timestamp) -> bool {
        match self {
            Guard::Vacant { expected_version } => {
                current.map(|r| r.version) == *expected_version
                    && !current.is_some_and(|r| r.is_live_at(now))
            }
            Guard::LiveHolder { holder, token } => current.is_some_and(|r| {
                r.holder == Some(*holder) && r.token == *token && r.is_live_at(now)
            }),
            Guard::Holder { holder, token } => {
                current.is_some_and(|r| r.holder == Some(*holder) && r.token == *token)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordWrite {
    Grant {
        holder: NodeId,
        token: FencingToken,
        ttl: Duration,
        lease_id: Uuid,
    },
    Extend { ttl: Duration },
    Clear,
}

impl RecordWrite {
    /// The record that replaces `current`, or `None` if the write makes no
    /// sense against it (extending nothing, or a grant that would not raise
    /// the token).
    pub fn apply(
        &self,
        key: &str,
        current: Option<&LeaseRecord>,
        now: Timestamp,
    ) -> Result<Option<LeaseRecord>> {
        let version = current.map_or(1, |r| r.version + 1);
        let expiry = |ttl: &Duration| {
            time::deadline(now, *ttl)
                .ok_or_else(|| Error::InvalidArgument(format!("ttl {ttl:?} overflows")))
        };

        let next = match self {
            RecordWrite::Grant {
                holder,
                token,
                ttl,
                lease_id,
            } => {
                if current.is_some_and(|r| *token <= r.token) {
                    return Ok(None);
                }
                Some(LeaseRecord {
                    key: key.to_string(),
                    holder: Some(*holder),
                    token: *token,
                    expires_at: expiry(ttl)?,
                    version,
                    lease_id: *lease_id,
                })
            }
            RecordWrite::Extend { ttl } => match current {
                Some(r) => Some(LeaseRecord {
                    expires_at: expiry(ttl)?,
                    version,
                    ..r.clone()
                }),
                None => None,
            },
            RecordWrite::Clear => current.map(|r| LeaseRecord {
                holder: None,
                expires_at: now,
                version,
                ..r.clone()
            }),
        };
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasRequest {
    pub guard: Guard,
    pub write: RecordWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied(LeaseRecord),
    Rejected {
        current: Option<LeaseRecord>,
        observed_at: Timestamp,
    },
}

/// A linearizable key-value store holding lease records.
#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Snapshot>;
    async fn compare_and_swap(&self, key: &str, request: CasRequest) -> Result<CasOutcome>;
}

/// Wraps a store with a per-operation deadline. A deadline miss is reported as
/// [`Error::StoreUnavailable`]; the write may or may not have landed, so
/// callers re-read before assuming either.
#[derive(Debug, Clone)]
pub struct StoreClient {
    store: Arc<dyn LeaseStore>,
    op_timeout: Duration,
}

impl StoreClient {
    pub fn new(store: Arc<dyn LeaseStore>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    pub async fn get(&self, key: &str) -> Result<Snapshot> {
        match tokio::time::timeout(self.op_timeout, self.store.get(key)).await {
            Ok(result) => result,
            Err(_) => Err(Error::unavailable(key, "get timed out")),
        }
    }

    pub async fn compare_and_swap(&self, key: &str, request: CasRequest) -> Result<CasOutcome> {
        trace!(key, ?request, "compare-and-swap");
        match tokio::time::timeout(self.op_timeout, self.store.compare_and_swap(key, request)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::unavailable(key, "compare-and-swap timed out")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    unavailable: bool,
    latency: Duration,
}

/// In-process linearizable store. Each key's guard check and write happen
/// under that key's map shard lock.
#[derive(Debug)]
pub struct MemoryStore {
    records: DashMap<String, LeaseRecord>,
    clock: Arc<dyn Clock>,
    faults: RwLock<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            faults: RwLock::new(Faults::default()),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// While set, every call fails with [`Error::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.write().unavailable = unavailable;
    }

    /// Delay added before every call is served.
    pub fn set_latency(&self, latency: Duration) {
        self.faults.write().latency = latency;
    }

    pub fn record(&self, key: &str) -> Option<LeaseRecord> {
        self.records.get(key).map(|entry| entry.clone())
    }

    async fn admit(&self, key: &str) -> Result<()> {
        let faults = *self.faults.read();
        if !faults.latency.is_zero() {
            tokio::time::sleep(faults.latency).await;
        }
        if faults.unavailable {
            return Err(Error::unavailable(key, "store offline"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Snapshot> {
        self.admit(key).await?;
        let record = self.record(key);
        Ok(Snapshot {
            record,
            observed_at: self.clock.now(),
        })
    }

    async fn compare_and_swap(&self, key: &str, request: CasRequest) -> Result<CasOutcome> {
        self.admit(key).await?;

        let entry = self.records.entry(key.to_string());
        // under the key's lock, so `now` never runs behind an earlier write
        let now = self.clock.now();
        match entry {
            Entry::Occupied(mut slot) => {
                if !request.guard.admits(Some(slot.get()), now) {
                    return Ok(CasOutcome::Rejected {
                        current: Some(slot.get().clone()),
                        observed_at: now,
                    });
                }
                match request.write.apply(key, Some(slot.get()), now)? {
                    Some(next) => {
                        slot.insert(next.clone());
                        Ok(CasOutcome::Applied(next))
                    }
                    None => Ok(CasOutcome::Rejected {
                        current: Some(slot.get().clone()),
                        observed_at: now,
                    }),
                }
            }
            Entry::Vacant(slot) => {
                if !request.guard.admits(None, now) {
                    return Ok(CasOutcome::Rejected {
                        current: None,
                        observed_at: now,
                    });
                }
                match request.write.apply(key, None, now)? {
                    Some(next) => {
                        slot.insert(next.clone());
                        Ok(CasOutcome::Applied(next))
                    }
                    None => Ok(CasOutcome::Rejected {
                        current: None,
                        observed_at: now,
                    }),
                }
            }
        }
    }
}
