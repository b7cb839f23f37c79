use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tenure::{
    store::{MemoryStore, StoreClient},
    time::{Clock, ManualClock},
    Error, FencingValidator, LeaseManager, NodeId,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("🔑 Lease lifecycle: a paused holder meets a fenced resource");
    println!("==========================================================\n");

    let clock = Arc::new(ManualClock::at_epoch());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let leases = LeaseManager::new(StoreClient::new(store.clone(), Duration::from_millis(500)));
    let ledger = FencingValidator::new();
    let ttl = Duration::from_secs(5);

    let a = NodeId::new();
    let b = NodeId::new();

    let lease_a = leases.acquire("acct:transfer", a, ttl).await?;
    println!(
        "✅ {a} holds acct:transfer with token {} until {}",
        lease_a.token, lease_a.expires_at
    );
    ledger.apply("acct:transfer", lease_a.token, || println!("   {a} debits 10"))?;

    println!("\n⏸  {a} stalls for 6s (GC pause, VM migration...)");
    clock.advance(Duration::from_secs(6));

    let lease_b = leases.acquire("acct:transfer", b, ttl).await?;
    println!("✅ {b} takes over with token {} until {}", lease_b.token, lease_b.expires_at);
    ledger.apply("acct:transfer", lease_b.token, || println!("   {b} debits 25"))?;

    println!("\n▶  {a} resumes at {}", clock.now());
    match leases.renew("acct:transfer", a, lease_a.token, ttl).await {
        Err(err @ Error::TokenMismatch { .. }) => println!("❌ renew refused: {err}"),
        other => println!("unexpected renew outcome: {other:?}"),
    }
    match ledger.apply("acct:transfer", lease_a.token, || println!("   {a} debits 10 again")) {
        Err(err) => println!("❌ ledger refused stale write: {err}"),
        Ok(()) => println!("stale write slipped through"),
    }

    leases.release("acct:transfer", b, lease_b.token).await?;
    let record = store.record("acct:transfer");
    println!(
        "\n🔓 released; store keeps token {:?} for the next holder",
        record.map(|r| r.token)
    );
    Ok(())
}
