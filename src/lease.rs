use crate::{
    error::Error,
    retry::RetryPolicy,
    store::{CasOutcome, CasRequest, Guard, LeaseRecord, RecordWrite, StoreClient},
    time::Timestamp,
    FencingToken, NodeId, Result,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub holder: NodeId,
    pub token: FencingToken,
    pub expires_at: Timestamp,
    pub version: u64,
    pub lease_id: Uuid,
}

impl Lease {
    fn from_record(record: LeaseRecord, holder: NodeId) -> Self {
        Self {
            key: record.key,
            holder,
            token: record.token,
            expires_at: record.expires_at,
            version: record.version,
            lease_id: record.lease_id,
        }
    }
}

/// Acquires, renews and releases leases through atomic store operations.
/// Safe to share between tasks; it keeps no state of its own.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: StoreClient,
    retry: RetryPolicy,
}

impl LeaseManager {
    pub fn new(store: StoreClient) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Takes `key` if nobody holds a live lease on it. The new token is one
    /// above whatever the key carried before.
    pub async fn acquire(&self, key: &str, holder: NodeId, ttl: Duration) -> Result<Lease> {
        self.acquire_as(key, holder, ttl, Uuid::new_v4()).await
    }

    /// [`acquire`](Self::acquire) under a caller-chosen `lease_id`.
    ///
    /// Retrying with the same id is safe: a grant from an earlier attempt
    /// whose reply was lost is found on the next read and adopted instead of
    /// being reported as a conflict.
    pub async fn acquire_as(
        &self,
        key: &str,
        holder: NodeId,
        ttl: Duration,
        lease_id: Uuid,
    ) -> Result<Lease> {
        validate(key, ttl)?;

        let snapshot = self.store.get(key).await?;
        if let Some(live) = snapshot.live_record() {
            if live.lease_id == lease_id && live.holder == Some(holder) {
                info!(key, %holder, token = %live.token, "earlier acquire had landed, adopting");
                return Ok(Lease::from_record(live.clone(), holder));
            }
            debug!(key, holder = ?live.holder, "lease held elsewhere");
            return Err(Error::Conflict {
                key: key.to_string(),
                holder: live.holder,
                expires_at: Some(live.expires_at),
            });
        }

        let (previous, expected_version) = match &snapshot.record {
            Some(record) => (record.token, Some(record.version)),
            None => (FencingToken::ZERO, None),
        };
        let request = CasRequest {
            guard: Guard::Vacant { expected_version },
            write: RecordWrite::Grant {
                holder,
                token: previous.next(),
                ttl,
                lease_id,
            },
        };

        let outcome = match self.store.compare_and_swap(key, request).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_retryable() => {
                return self.recheck_grant(key, holder, lease_id, err).await;
            }
            Err(err) => return Err(err),
        };
        match outcome {
            CasOutcome::Applied(record) => {
                info!(key, %holder, token = %record.token, "lease acquired");
                Ok(Lease::from_record(record, holder))
            }
            CasOutcome::Rejected { current, .. } => {
                // Someone else's write landed between our read and our CAS.
                debug!(key, %holder, "lost acquire race");
                Err(Error::Conflict {
                    key: key.to_string(),
                    holder: current.as_ref().and_then(|r| r.holder),
                    expires_at: current.map(|r| r.expires_at),
                })
            }
        }
    }

    /// After a grant whose outcome is unknown, reads the key back. Returns the
    /// lease if the grant landed, otherwise the original failure.
    async fn recheck_grant(
        &self,
        key: &str,
        holder: NodeId,
        lease_id: Uuid,
        failure: Error,
    ) -> Result<Lease> {
        match self.store.get(key).await {
            Ok(snapshot) => match snapshot.live_record().filter(|r| r.lease_id == lease_id) {
                Some(record) => {
                    info!(key, %holder, token = %record.token, "lease acquired, reply was lost");
                    Ok(Lease::from_record(record.clone(), holder))
                }
                None => Err(failure),
            },
            Err(err) => {
                debug!(key, %holder, error = %err, "grant outcome still unknown");
                Err(failure)
            }
        }
    }

    /// Extends a live lease in one guarded write. Never extends a lease that
    /// has expired or changed hands, even if nobody else has taken it yet.
    pub async fn renew(
        &self,
        key: &str,
        holder: NodeId,
        token: FencingToken,
        ttl: Duration,
    ) -> Result<Timestamp> {
        validate(key, ttl)?;

        let request = CasRequest {
            guard: Guard::LiveHolder { holder, token },
            write: RecordWrite::Extend { ttl },
        };
        match self.store.compare_and_swap(key, request).await? {
            CasOutcome::Applied(record) => {
                debug!(key, %holder, %token, expires_at = %record.expires_at, "lease renewed");
                Ok(record.expires_at)
            }
            CasOutcome::Rejected { current, .. } => {
                let err = renew_rejection(key, holder, token, current);
                warn!(key, %holder, %token, error = %err, "renew rejected");
                Err(err)
            }
        }
    }

    /// Clears the lease if `holder` still owns it under `token`. A mismatch is
    /// a no-op, so releasing twice is harmless.
    pub async fn release(&self, key: &str, holder: NodeId, token: FencingToken) -> Result<()> {
        let request = CasRequest {
            guard: Guard::Holder { holder, token },
            write: RecordWrite::Clear,
        };
        match self.store.compare_and_swap(key, request).await? {
            CasOutcome::Applied(_) => info!(key, %holder, %token, "lease released"),
            CasOutcome::Rejected { .. } => {
                debug!(key, %holder, %token, "release skipped, lease no longer ours");
            }
        }
        Ok(())
    }

    /// The live lease on `key` as the store sees it right now.
    pub async fn current(&self, key: &str) -> Result<Option<Lease>> {
        let snapshot = self.store.get(key).await?;
        Ok(snapshot.live_record().and_then(|record| {
            record
                .holder
                .map(|holder| Lease::from_record(record.clone(), holder))
        }))
    }

    /// Keeps trying [`acquire`](Self::acquire) through conflicts and transient
    /// failures until `wait` runs out; the last error is returned on give-up.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        holder: NodeId,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Lease> {
        // `None` waits forever
        let deadline = Instant::now().checked_add(wait);
        let lease_id = Uuid::new_v4();
        let mut attempt = 0;
        loop {
            let err = match self.acquire_as(key, holder, ttl, lease_id).await {
                Ok(lease) => return Ok(lease),
                Err(err) if matches!(err, Error::Conflict { .. }) || err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            let delay = self.retry.delay(attempt);
            if out_of_time(deadline, delay) {
                return Err(err);
            }
            debug!(key, %holder, attempt, ?delay, "acquire retry");
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

/// Whether sleeping `delay` more would overrun `deadline`.
pub(crate) fn out_of_time(deadline: Option<Instant>, delay: Duration) -> bool {
    deadline.is_some_and(|deadline| {
        Instant::now()
            .checked_add(delay)
            .map_or(true, |wake| wake >= deadline)
    })
}

fn validate(key: &str, ttl: Duration) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("lease key is empty".into()));
    }
    if ttl.is_zero() {
        return Err(Error::InvalidArgument(format!("zero ttl for {key:?}")));
    }
    Ok(())
}

fn renew_rejection(
    key: &str,
    holder: NodeId,
    token: FencingToken,
    current: Option<LeaseRecord>,
) -> Error {
    match current {
        Some(record) if record.token != token => Error::TokenMismatch {
            key: key.to_string(),
            presented: token,
            current: record.token,
        },
        Some(record) if record.holder == Some(holder) => Error::Expired {
            key: key.to_string(),
            expires_at: record.expires_at,
        },
        _ => Error::NotHolder {
            key: key.to_string(),
            holder,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::FlakyStore;
    use crate::time::ManualClock;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn manager() -> (LeaseManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let client = StoreClient::new(store, Duration::from_millis(200));
        (LeaseManager::new(client), clock)
    }

    fn flaky_manager() -> (LeaseManager, Arc<FlakyStore>) {
        let store = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new())));
        let client = StoreClient::new(store.clone(), Duration::from_millis(100));
        (LeaseManager::new(client), store)
    }

    #[tokio::test]
    async fn test_acquire_conflict_then_expiry() {
        let (leases, clock) = manager();
        let a = NodeId::new();
        let b = NodeId::new();

        let first = assert_ok!(leases.acquire("k", a, Duration::from_secs(5)).await);
        assert_eq!(first.token, FencingToken(1));

        let err = assert_err!(leases.acquire("k", b, Duration::from_secs(5)).await);
        assert!(matches!(err, Error::Conflict { holder: Some(h), .. } if h == a));

        clock.advance(Duration::from_secs(6));
        let second = assert_ok!(leases.acquire("k", b, Duration::from_secs(5)).await);
        assert_eq!(second.token, FencingToken(2));
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_inclusive() {
        let (leases, clock) = manager();
        let a = NodeId::new();
        let lease = leases.acquire("k", a, Duration::from_secs(5)).await.unwrap();

        // expires_at == now is still live
        clock.advance(Duration::from_secs(5));
        assert_ok!(leases.renew("k", a, lease.token, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_renew_rejections() {
        let (leases, clock) = manager();
        let a = NodeId::new();
        let lease = leases.acquire("k", a, Duration::from_secs(5)).await.unwrap();

        let stranger = NodeId::new();
        let err = leases
            .renew("k", stranger, lease.token, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotHolder { .. }));

        let err = leases
            .renew("k", a, FencingToken(9), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenMismatch { .. }));

        clock.advance(Duration::from_secs(6));
        let err = leases
            .renew("k", a, lease.token, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Expired { .. }));
        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_guarded() {
        let (leases, _clock) = manager();
        let a = NodeId::new();
        let lease = leases.acquire("k", a, Duration::from_secs(5)).await.unwrap();

        // wrong token: no-op
        leases.release("k", a, FencingToken(7)).await.unwrap();
        assert!(leases.current("k").await.unwrap().is_some());

        leases.release("k", a, lease.token).await.unwrap();
        leases.release("k", a, lease.token).await.unwrap();
        assert!(leases.current("k").await.unwrap().is_none());

        let next = leases.acquire("k", NodeId::new(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(next.token, FencingToken(2));
    }

    #[tokio::test]
    async fn test_rejects_bad_arguments() {
        let (leases, _clock) = manager();
        let a = NodeId::new();
        assert!(matches!(
            leases.acquire("", a, Duration::from_secs(1)).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            leases.acquire("k", a, Duration::ZERO).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_waits_for_release() {
        let (leases, _clock) = manager();
        let a = NodeId::new();
        let b = NodeId::new();
        let held = leases.acquire("k", a, Duration::from_secs(30)).await.unwrap();

        let releaser = leases.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            releaser.release("k", a, held.token).await.unwrap();
        });

        let lease = leases
            .acquire_with_retry("k", b, Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(lease.holder, b);
        assert_eq!(lease.token, FencingToken(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_gives_up() {
        let (leases, _clock) = manager();
        leases
            .acquire("k", NodeId::new(), Duration::from_secs(30))
            .await
            .unwrap();

        let err = leases
            .acquire_with_retry(
                "k",
                NodeId::new(),
                Duration::from_secs(5),
                Duration::from_millis(300),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_adopts_grant_whose_reply_was_lost() {
        let (leases, store) = flaky_manager();
        let me = NodeId::new();
        store.lose_next_reply("k", Duration::from_secs(1), 0);

        let lease = assert_ok!(leases.acquire("k", me, Duration::from_secs(30)).await);
        assert_eq!(lease.holder, me);
        assert_eq!(lease.token, FencingToken(1));
        assert_eq!(leases.current("k").await.unwrap(), Some(lease));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_adopts_own_grant_after_unknown_outcome() {
        let (leases, store) = flaky_manager();
        let me = NodeId::new();
        // the reply is lost and so is the read-back right after it
        store.lose_next_reply("k", Duration::from_secs(1), 1);

        let lease = leases
            .acquire_with_retry("k", me, Duration::from_secs(30), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(lease.holder, me);
        assert_eq!(lease.token, FencingToken(1));

        // adopted, not granted a second time
        let record = store.inner().record("k").unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.lease_id, lease.lease_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_task_with_same_holder_still_conflicts() {
        let (leases, store) = flaky_manager();
        let me = NodeId::new();
        store.lose_next_reply("k", Duration::from_secs(1), 1);

        let err = assert_err!(leases.acquire("k", me, Duration::from_secs(30)).await);
        assert!(err.is_retryable());

        // a fresh acquire under the same holder id is a different grant
        let err = assert_err!(leases.acquire("k", me, Duration::from_secs(30)).await);
        assert!(matches!(err, Error::Conflict { holder: Some(h), .. } if h == me));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_accepts_unbounded_wait() {
        let (leases, _clock) = manager();
        let a = NodeId::new();
        let held = leases.acquire("k", a, Duration::from_secs(30)).await.unwrap();

        let releaser = leases.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            releaser.release("k", a, held.token).await.unwrap();
        });

        let lease = leases
            .acquire_with_retry("k", NodeId::new(), Duration::from_secs(5), Duration::MAX)
            .await
            .unwrap();
        assert_eq!(lease.token, FencingToken(2));
    }
}
