use std::sync::Arc;
use std::time::Duration;
use tenure::{
    retry::RetryPolicy,
    store::{MemoryStore, StoreClient},
    Error, FencingToken, LeaseManager, NodeId, OrderedLockSet,
};

fn shared_leases(store: Arc<MemoryStore>) -> Arc<LeaseManager> {
    let retry = RetryPolicy {
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
        multiplier: 2,
    };
    Arc::new(LeaseManager::new(StoreClient::new(store, Duration::from_secs(1))).with_retry(retry))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_orders_never_deadlock() {
    const PAIRS: usize = 100;
    const ROUNDS: usize = 100;
    const TTL: Duration = Duration::from_secs(5);
    const WAIT: Duration = Duration::from_secs(10);

    let leases = shared_leases(Arc::new(MemoryStore::new()));
    let mut pairs = Vec::new();
    for pair in 0..PAIRS {
        let leases = leases.clone();
        pairs.push(tokio::spawn(async move {
            let a = format!("acct:{pair}:a");
            let b = format!("acct:{pair}:b");
            let forward = OrderedLockSet::new(leases.clone(), NodeId::new());
            let backward = OrderedLockSet::new(leases, NodeId::new());

            for _ in 0..ROUNDS {
                let keys_ab = [a.clone(), b.clone()];
                let keys_ba = [b.clone(), a.clone()];
                let forward = forward.clone();
                let backward = backward.clone();
                let one = tokio::spawn(async move {
                    let handle = forward
                        .acquire_all_timeout(&keys_ab, TTL, WAIT)
                        .await?;
                    tokio::task::yield_now().await;
                    forward.release(handle).await
                });
                let two = tokio::spawn(async move {
                    let handle = backward
                        .acquire_all_timeout(&keys_ba, TTL, WAIT)
                        .await?;
                    tokio::task::yield_now().await;
                    backward.release(handle).await
                });
                one.await.unwrap()?;
                two.await.unwrap()?;
            }
            Ok::<_, Error>(())
        }));
    }

    let all = async {
        for pair in pairs {
            pair.await.unwrap().unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(120), all)
        .await
        .expect("lock set contention did not finish");
    println!("✅ {} opposite-order acquisitions completed", PAIRS * ROUNDS);
}

#[tokio::test]
async fn test_partial_acquire_rolls_back() {
    let store = Arc::new(MemoryStore::new());
    let leases = shared_leases(store.clone());
    let blocker = OrderedLockSet::new(leases.clone(), NodeId::new());
    let held = blocker
        .acquire_all(&["inv:m"], Duration::from_secs(30))
        .await
        .unwrap();

    let mover = OrderedLockSet::new(leases.clone(), NodeId::new());
    let err = mover
        .acquire_all(&["inv:n", "inv:l", "inv:m"], Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));

    // "inv:l" was taken first and must be free again; "inv:n" was never reached
    assert!(leases.current("inv:l").await.unwrap().is_none());
    assert!(store.record("inv:n").is_none());

    blocker.release(held).await.unwrap();
    let handle = mover
        .acquire_all(&["inv:n", "inv:l", "inv:m"], Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(handle.token("inv:l"), Some(FencingToken(2)));
    assert_eq!(handle.token("inv:m"), Some(FencingToken(2)));
    assert_eq!(handle.token("inv:n"), Some(FencingToken(1)));
}

#[tokio::test(start_paused = true)]
async fn test_crashed_holder_frees_keys_by_expiry() {
    let leases = shared_leases(Arc::new(MemoryStore::new()));
    let crashed = OrderedLockSet::new(leases.clone(), NodeId::new());
    let _abandoned = crashed
        .acquire_all(&["x", "y"], Duration::from_secs(1))
        .await
        .unwrap();

    let survivor = OrderedLockSet::new(leases, NodeId::new());
    let handle = survivor
        .acquire_all_timeout(&["y", "x"], Duration::from_secs(1), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(handle.token("x"), Some(FencingToken(2)));
    assert_eq!(handle.token("y"), Some(FencingToken(2)));
}

#[tokio::test(start_paused = true)]
async fn test_bounded_wait_gives_up() {
    let leases = shared_leases(Arc::new(MemoryStore::new()));
    let holder = OrderedLockSet::new(leases.clone(), NodeId::new());
    let _held = holder
        .acquire_all(&["k"], Duration::from_secs(60))
        .await
        .unwrap();

    let waiter = OrderedLockSet::new(leases, NodeId::new());
    let err = waiter
        .acquire_all_timeout(&["k"], Duration::from_secs(1), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}
