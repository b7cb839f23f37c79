use anyhow::{bail, Result};
use futures::FutureExt;
use std::time::Duration;
use tenure::{
    test_utils::{create_test_cluster, LatencySimulator},
    FencingValidator, NodeId,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("👑 Leader failover in a 5-node cluster");
    println!("======================================\n");

    let cluster = create_test_cluster(5, LatencySimulator::default())?;
    let ids = cluster.ids();
    for node in &cluster.nodes {
        let id = node.node_id();
        node.on_leadership_change(move |state| {
            async move {
                match state.fencing_token() {
                    Some(token) => println!("   📣 {id} now leads with token {token}"),
                    None => println!("   📣 {id} is no longer leader"),
                }
            }
            .boxed()
        });
    }

    let Some(first) = cluster.wait_for_leader(&ids, Duration::from_secs(5)).await else {
        bail!("no leader elected");
    };
    let first_token = cluster.node(first).and_then(|n| n.fencing_token());
    println!("✅ {first} elected");

    // The protected resource only trusts the newest leader.
    let registry = FencingValidator::new();
    if let Some(token) = first_token {
        registry.accept("config", token)?;
    }

    println!("\n✂️  Isolating {first} from the rest");
    let others: Vec<NodeId> = ids.iter().copied().filter(|id| *id != first).collect();
    cluster.network.isolate(first, &others);

    let Some(second) = cluster.wait_for_leader(&others, Duration::from_secs(10)).await else {
        bail!("majority failed to elect a replacement");
    };
    let second_token = cluster.node(second).and_then(|n| n.fencing_token());
    println!("✅ {second} took over");

    if let Some(token) = second_token {
        registry.accept("config", token)?;
    }
    if let Some(token) = first_token {
        match registry.accept("config", token) {
            Err(err) => println!("❌ old leader's write refused: {err}"),
            Ok(()) => println!("old leader's write was accepted"),
        }
    }

    cluster.network.heal();
    tokio::time::sleep(Duration::from_millis(500)).await;
    cluster.shutdown().await;
    println!("\n🎉 done");
    Ok(())
}
