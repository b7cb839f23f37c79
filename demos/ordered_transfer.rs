use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tenure::{
    Coordinator, CoordinatorConfig, FencingValidator, GuardedOutcome, InDoubtPolicy, MemoryStore,
};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Moves `amount` between two accounts under both locks, fenced per account.
async fn transfer(
    coordinator: &Coordinator,
    ledger: &Mutex<Vec<i64>>,
    fence: &FencingValidator,
    from: usize,
    to: usize,
    amount: i64,
) -> Result<()> {
    let keys = [format!("acct:{from}"), format!("acct:{to}")];
    let handle = coordinator
        .acquire_lock_timeout(&keys, Duration::from_secs(2), Duration::from_secs(10))
        .await?;

    let mut balances = ledger.lock().await;
    for key in handle.keys() {
        if let Some(token) = handle.token(key) {
            fence.accept(key, token)?;
        }
    }
    balances[from] -= amount;
    balances[to] += amount;
    drop(balances);

    coordinator.release_lock(handle).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("💸 Ordered transfers: opposite directions, no deadlock");
    println!("=====================================================\n");

    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(Mutex::new(vec![1_000i64, 1_000]));
    let fence = Arc::new(FencingValidator::new());

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let coordinator = Coordinator::new(CoordinatorConfig::default(), store.clone())?;
        let ledger = ledger.clone();
        let fence = fence.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..50 {
                // half the workers go 0 -> 1, the rest 1 -> 0
                let (from, to) = if worker % 2 == 0 { (0, 1) } else { (1, 0) };
                transfer(&coordinator, &ledger, &fence, from, to, round % 7 + 1).await?;
            }
            anyhow::Ok(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    let balances = ledger.lock().await.clone();
    let total: i64 = balances.iter().sum();
    println!("✅ 400 transfers done, balances {balances:?}, total {total}");

    println!("\n🛡  Guarded work with a caller-chosen in-doubt policy");
    let coordinator = Coordinator::new(CoordinatorConfig::default(), store)?;
    let outcome = coordinator
        .run_guarded(
            &["acct:0", "acct:1"],
            Duration::from_secs(1),
            InDoubtPolicy::PresumeAbort,
            |tokens| async move {
                tokio::time::sleep(Duration::from_millis(1_500)).await;
                tokens.len()
            },
        )
        .await?;
    match outcome {
        GuardedOutcome::Completed(n) => println!("✅ audit finished holding {n} locks throughout"),
        GuardedOutcome::PresumedCommitted { cause, .. } => {
            println!("⚠️  presumed committed: {cause}");
        }
        GuardedOutcome::PresumedAborted { cause } => println!("⚠️  presumed aborted: {cause}"),
    }
    Ok(())
}
