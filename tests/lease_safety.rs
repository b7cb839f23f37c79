use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tenure::{
    store::{MemoryStore, StoreClient},
    time::{Clock, ManualClock},
    Error, FencingToken, FencingValidator, LeaseManager, NodeId,
};

fn manager_with_clock() -> (LeaseManager, Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_epoch());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let leases = LeaseManager::new(StoreClient::new(store.clone(), Duration::from_secs(1)));
    (leases, store, clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_single_winner() {
    let (leases, _store, _clock) = manager_with_clock();
    let leases = Arc::new(leases);

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let leases = leases.clone();
        tasks.push(tokio::spawn(async move {
            leases.acquire("hot", NodeId::new(), Duration::from_secs(5)).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(lease) => {
                winners += 1;
                assert_eq!(lease.token, FencingToken(1));
            }
            Err(err) => assert!(matches!(err, Error::Conflict { .. }), "{err}"),
        }
    }
    assert_eq!(winners, 1);
    println!("✅ one winner among 32 concurrent acquirers");
}

#[tokio::test]
async fn test_paused_holder_is_fenced_out() {
    let (leases, store, clock) = manager_with_clock();
    let fence = FencingValidator::new();
    let a = NodeId::new();
    let b = NodeId::new();
    let ttl = Duration::from_secs(5);

    let lease_a = leases.acquire("acct:transfer", a, ttl).await.unwrap();
    assert_eq!(lease_a.token, FencingToken(1));
    fence.accept("acct:transfer", lease_a.token).unwrap();

    // A stalls past its ttl; B takes over at T+6
    clock.advance(Duration::from_secs(6));
    let lease_b = leases.acquire("acct:transfer", b, ttl).await.unwrap();
    assert_eq!(lease_b.token, FencingToken(2));
    assert_eq!(lease_b.expires_at.timestamp(), 11);
    fence.accept("acct:transfer", lease_b.token).unwrap();

    // A wakes up and tries to carry on
    let err = leases
        .renew("acct:transfer", a, lease_a.token, ttl)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TokenMismatch {
            presented: FencingToken(1),
            current: FencingToken(2),
            ..
        }
    ));
    assert!(matches!(
        fence.accept("acct:transfer", lease_a.token),
        Err(Error::StaleToken { .. })
    ));

    let record = store.record("acct:transfer").unwrap();
    assert_eq!(record.holder, Some(b));
    assert_eq!(record.token, FencingToken(2));
    assert_eq!(record.expires_at.timestamp(), 11);
    println!("✅ stale holder rejected at {}", clock.now());
}

#[tokio::test]
async fn test_release_then_reacquire_advances_token() {
    let (leases, _store, _clock) = manager_with_clock();
    let holder = NodeId::new();
    let mut last = FencingToken::ZERO;
    for _ in 0..5 {
        let lease = leases.acquire("k", holder, Duration::from_secs(1)).await.unwrap();
        assert!(lease.token > last);
        last = lease.token;
        leases.release("k", holder, lease.token).await.unwrap();
    }
    assert_eq!(last, FencingToken(5));
}

#[derive(Debug, Clone)]
enum Step {
    Acquire(usize),
    Renew(usize),
    Release(usize),
    Advance(u64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..3).prop_map(Step::Acquire),
        (0usize..3).prop_map(Step::Renew),
        (0usize..3).prop_map(Step::Release),
        (0u64..8).prop_map(Step::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tokens_strictly_increase_and_holders_never_overlap(
        steps in proptest::collection::vec(step(), 1..80)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (leases, store, clock) = manager_with_clock();
            let nodes: Vec<NodeId> = (0..3).map(|_| NodeId::new()).collect();
            let mut held: Vec<Option<FencingToken>> = vec![None; 3];
            let mut issued = Vec::new();
            // (holder, token, expiry) of the grant the store last handed out
            let mut granted: Option<(usize, FencingToken, tenure::time::Timestamp)> = None;

            for step in steps {
                let now = clock.now();
                match step {
                    Step::Acquire(i) => {
                        let acquired = leases.acquire("k", nodes[i], Duration::from_secs(3)).await;
                        if let Ok(lease) = acquired {
                            if let Some((_, _, expires_at)) = granted {
                                prop_assert!(now > expires_at, "granted over a live lease");
                            }
                            issued.push(lease.token);
                            held[i] = Some(lease.token);
                            granted = Some((i, lease.token, lease.expires_at));
                        }
                    }
                    Step::Renew(i) => {
                        if let Some(token) = held[i] {
                            match leases.renew("k", nodes[i], token, Duration::from_secs(3)).await {
                                Ok(expires_at) => {
                                    prop_assert_eq!(granted.map(|g| (g.0, g.1)), Some((i, token)));
                                    granted = Some((i, token, expires_at));
                                }
                                Err(_) => held[i] = None,
                            }
                        }
                    }
                    Step::Release(i) => {
                        if let Some(token) = held[i].take() {
                            leases.release("k", nodes[i], token).await.unwrap();
                            if granted.is_some_and(|g| g.0 == i && g.1 == token) {
                                granted = None;
                            }
                        }
                    }
                    Step::Advance(secs) => clock.advance(Duration::from_secs(secs)),
                }

                if let Some(record) = store.record("k") {
                    prop_assert!(record.token >= issued.last().copied().unwrap_or_default());
                }
            }

            prop_assert!(issued.windows(2).all(|w| w[0] < w[1]), "tokens {issued:?}");
            Ok(())
        })?;
    }
}
