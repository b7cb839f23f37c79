//! Multi-key locking without circular wait.
//!
//! Every caller walks its keys in the same total order (bytewise), so no two
//! callers can each hold a key the other is still waiting for. Each key is a
//! TTL lease, so a holder that crashes midway frees its keys by expiry.

use crate::{
    error::Error,
    lease::{out_of_time, LeaseManager},
    time::Timestamp,
    FencingToken, NodeId, Result,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Proof of holding every key of one [`OrderedLockSet::acquire_all`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    holder: NodeId,
    keys: Vec<String>,
    tokens: BTreeMap<String, FencingToken>,
    expires_at: Timestamp,
    ttl: Duration,
}

impl LockHandle {
    pub fn holder(&self) -> NodeId {
        self.holder
    }

    /// Keys in acquisition order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn tokens(&self) -> &BTreeMap<String, FencingToken> {
        &self.tokens
    }

    pub fn token(&self, key: &str) -> Option<FencingToken> {
        self.tokens.get(key).copied()
    }

    /// Earliest expiry among the held keys.
    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// False once a renewal has failed and the keys were let go.
    pub fn is_held(&self) -> bool {
        !self.tokens.is_empty()
    }
}

/// What to assume about work that was running when its lock was lost.
/// Which bias is right depends on the workload, so there is no default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InDoubtPolicy {
    /// Let the work finish and treat its effects as committed.
    PresumeCommit,
    /// Cancel the work and treat its effects as not having happened.
    PresumeAbort,
}

#[derive(Debug)]
pub enum GuardedOutcome<T> {
    /// Work finished while every key was still held.
    Completed(T),
    /// Lock was lost mid-work; the work ran to completion anyway.
    PresumedCommitted { output: T, cause: Error },
    /// Lock was lost mid-work; the work was dropped.
    PresumedAborted { cause: Error },
}

#[derive(Debug, Clone)]
pub struct OrderedLockSet {
    leases: Arc<LeaseManager>,
    holder: NodeId,
}

impl OrderedLockSet {
    pub fn new(leases: Arc<LeaseManager>, holder: NodeId) -> Self {
        Self { leases, holder }
    }

    pub fn holder(&self) -> NodeId {
        self.holder
    }

    /// Acquires every key or none of them. Keys are sorted and deduplicated
    /// first; on the first failure the keys already taken are released in
    /// reverse order and that failure is returned.
    pub async fn acquire_all<K: AsRef<str>>(
        &self,
        keys: &[K],
        ttl: Duration,
    ) -> Result<LockHandle> {
        self.acquire_all_as(keys, ttl, Uuid::new_v4()).await
    }

    async fn acquire_all_as<K: AsRef<str>>(
        &self,
        keys: &[K],
        ttl: Duration,
        lease_id: Uuid,
    ) -> Result<LockHandle> {
        let keys = canonical_order(keys);
        if keys.is_empty() {
            return Err(Error::InvalidArgument("no keys to lock".into()));
        }

        let mut tokens = BTreeMap::new();
        let mut expires_at: Option<Timestamp> = None;
        for (i, key) in keys.iter().enumerate() {
            match self.leases.acquire_as(key, self.holder, ttl, lease_id).await {
                Ok(lease) => {
                    tokens.insert(key.clone(), lease.token);
                    let earliest = expires_at.map_or(lease.expires_at, |e| e.min(lease.expires_at));
                    expires_at = Some(earliest);
                }
                Err(err) => {
                    debug!(key = %key, error = %err, "lock set acquire failed, unwinding");
                    if err.is_retryable() {
                        self.release_in_doubt(key, lease_id).await;
                    }
                    self.release_keys(&keys[..i], &tokens).await;
                    return Err(err);
                }
            }
        }

        let Some(expires_at) = expires_at else {
            return Err(Error::InvalidArgument("no keys to lock".into()));
        };
        info!(holder = %self.holder, keys = ?keys, "lock set acquired");
        Ok(LockHandle {
            holder: self.holder,
            keys,
            tokens,
            expires_at,
            ttl,
        })
    }

    /// Retries [`acquire_all`](Self::acquire_all) through conflicts and
    /// transient failures, giving up after `wait`. `Duration::MAX` waits
    /// indefinitely.
    pub async fn acquire_all_timeout<K: AsRef<str>>(
        &self,
        keys: &[K],
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockHandle> {
        let retry = self.leases.retry_policy();
        let deadline = Instant::now().checked_add(wait);
        // one id for every attempt, so a grant from a lost reply is recognised
        let lease_id = Uuid::new_v4();
        let mut attempt = 0;
        loop {
            let err = match self.acquire_all_as(keys, ttl, lease_id).await {
                Ok(handle) => return Ok(handle),
                Err(err) if matches!(err, Error::Conflict { .. }) || err.is_retryable() => err,
                Err(err) => return Err(err),
            };
            let delay = retry.delay(attempt);
            if out_of_time(deadline, delay) {
                return Err(err);
            }
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Renews every key. If any renewal fails the whole lock is gone: the
    /// remaining keys are released, the handle is emptied and
    /// [`Error::LockLost`] names the key that failed.
    pub async fn renew(&self, handle: &mut LockHandle) -> Result<Timestamp> {
        if !handle.is_held() {
            return Err(Error::InvalidArgument("lock handle already released".into()));
        }

        let mut earliest: Option<Timestamp> = None;
        for key in &handle.keys {
            let Some(token) = handle.token(key) else {
                continue;
            };
            match self.leases.renew(key, handle.holder, token, handle.ttl).await {
                Ok(expiry) => {
                    earliest = Some(earliest.map_or(expiry, |e| e.min(expiry)));
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "lock set renewal failed, dropping whole set");
                    let failed = key.clone();
                    let tokens = std::mem::take(&mut handle.tokens);
                    self.release_keys(&handle.keys, &tokens).await;
                    return Err(Error::LockLost {
                        key: failed,
                        source: Box::new(err),
                    });
                }
            }
        }

        if let Some(expiry) = earliest {
            handle.expires_at = expiry;
        }
        Ok(handle.expires_at)
    }

    /// Releases in reverse acquisition order. Keys that already changed hands
    /// are skipped by the lease manager.
    pub async fn release(&self, mut handle: LockHandle) -> Result<()> {
        let tokens = std::mem::take(&mut handle.tokens);
        let mut first_err = None;
        for key in handle.keys.iter().rev() {
            let Some(token) = tokens.get(key) else {
                continue;
            };
            if let Err(err) = self.leases.release(key, handle.holder, *token).await {
                warn!(key = %key, error = %err, "release failed, lease will expire");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs `work` while holding `keys`, renewing at a third of the ttl. The
    /// work receives the per-key tokens to present to fenced resources. If the
    /// lock is lost before the work finishes, `policy` decides its fate.
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
        let mut handle = self.acquire_all(keys, ttl).await?;
        let work = work(handle.tokens().clone());
        tokio::pin!(work);

        let renew_every = (ttl / 3).max(Duration::from_millis(1));
        loop {
            tokio::select! {
                output = &mut work => {
                    if let Err(err) = self.release(handle).await {
                        warn!(error = %err, "release after guarded work failed");
                    }
                    return Ok(GuardedOutcome::Completed(output));
                }
                () = tokio::time::sleep(renew_every) => {
                    if let Err(cause) = self.renew(&mut handle).await {
                        return Ok(match policy {
                            InDoubtPolicy::PresumeAbort => {
                                warn!(error = %cause, "lock lost mid-work, presuming abort");
                                GuardedOutcome::PresumedAborted { cause }
                            }
                            InDoubtPolicy::PresumeCommit => {
                                warn!(error = %cause, "lock lost mid-work, presuming commit");
                                let output = (&mut work).await;
                                GuardedOutcome::PresumedCommitted { output, cause }
                            }
                        });
                    }
                }
            }
        }
    }

    /// Releases `key` if a grant under `lease_id` landed even though its
    /// acquire reported failure.
    async fn release_in_doubt(&self, key: &str, lease_id: Uuid) {
        match self.leases.current(key).await {
            Ok(Some(lease)) if lease.lease_id == lease_id && lease.holder == self.holder => {
                if let Err(err) = self.leases.release(key, self.holder, lease.token).await {
                    warn!(key, error = %err, "in-doubt release failed, lease will expire");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(key, error = %err, "could not re-check in-doubt key, it will expire"),
        }
    }

    async fn release_keys(&self, keys: &[String], tokens: &BTreeMap<String, FencingToken>) {
        for key in keys.iter().rev() {
            if let Some(token) = tokens.get(key) {
                if let Err(err) = self.leases.release(key, self.holder, *token).await {
                    warn!(key = %key, error = %err, "unwind release failed, lease will expire");
                }
            }
        }
    }
}

fn canonical_order<K: AsRef<str>>(keys: &[K]) -> Vec<String> {
    let mut keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
    // String's Ord is bytewise, which is the total order every caller shares.
    keys.sort_unstable();
    keys.dedup();
    keys
}
