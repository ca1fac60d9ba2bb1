use replication_sim::{simulate_replication, simulate_scaling, SimulationConfig};
use tracing_subscriber::EnvFilter;
pub mod replication_sim;

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,oplog_engine=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(async_main()) {
        tracing::error!(error = %e, "simulation failed");
        std::process::exit(1);
    }
}

async fn async_main() -> Result<(), oplog_engine::LogError> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            REPLICATION SIMULATION                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Run 1: small cluster
    simulate_replication(&SimulationConfig::default()).await?.print();

    // Run 2: medium cluster, fixed gossip pattern
    let config = SimulationConfig {
        replicas: 10,
        ops_per_replica: 200,
        syncs: 500,
        seed: Some(42),
        ..SimulationConfig::default()
    };
    simulate_replication(&config).await?.print();

    // Run 3: scaling analysis
    simulate_scaling(12, 4).await?;

    println!("\n✓ All replicas converged successfully!");
    Ok(())
}
