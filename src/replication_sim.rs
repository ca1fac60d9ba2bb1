use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use oplog_core::{Ed25519Identity, Hash};
use oplog_engine::{Log, LogError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::warn;

/// Scenario sizes for one simulation run.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub replicas: usize,
    pub ops_per_replica: usize,
    pub syncs: usize,
    /// Fixed seed for the gossip pattern; random when `None`.
    pub seed: Option<u64>,
    pub log_id: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            replicas: 4,
            ops_per_replica: 100,
            syncs: 200,
            seed: None,
            log_id: "sim".to_string(),
        }
    }
}

/// Statistics collected during a simulation run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub num_replicas: usize,
    pub operations_per_replica: usize,
    pub total_syncs: usize,
    pub entries_per_replica: usize,
    pub converged: bool,
    pub total_time: Duration,
    pub avg_sync_time: Duration,
    pub ops_per_second: f64,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Replication Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Replicas:        {:>38} ║", self.num_replicas);
        println!("║  Appends per Replica:       {:>38} ║", self.operations_per_replica);
        println!("║  Total Sync Operations:     {:>38} ║", self.total_syncs);
        println!("║  Entries per Replica:       {:>38} ║", self.entries_per_replica);
        println!("║  Converged:                 {:>38} ║", if self.converged { "yes" } else { "NO" });
        println!("║  Total Time:                {:>39}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Sync Time:         {:>36}µs ║", format!("{:.2}", self.avg_sync_time.as_micros()));
        println!("║  Operations/Second:         {:>38.0} ║", self.ops_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Yields (source, target) replica pairs for gossip rounds
fn gossip_pairs(num_replicas: usize, num_syncs: usize, seed: Option<u64>) -> impl Stream<Item = (usize, usize)> {
    stream! {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        for _ in 0..num_syncs {
            let source = rng.gen_range(0..num_replicas);
            let target = rng.gen_range(0..num_replicas);
            yield (source, target);
        }
    }
}

/// Pull `source`'s heads and missing history into `target`.
async fn sync_pair(
    replicas: &[Log],
    source: usize,
    target: usize,
    num_syncs: usize,
    sync_times: &mut Vec<Duration>,
    total_syncs: &mut usize,
) -> Result<(), LogError> {
    if source == target {
        return Ok(());
    }

    let sync_start = Instant::now();
    replicas[target].join_log(&replicas[source]).await?;
    sync_times.push(sync_start.elapsed());
    *total_syncs += 1;

    if *total_syncs % 100 == 0 {
        println!("  Syncs completed: {}/{}", total_syncs, num_syncs);
    }
    Ok(())
}

fn frontier(log: &Log) -> BTreeSet<Hash> {
    log.head_hashes().into_iter().collect()
}

/// Concurrent writers on separate replicas, random pairwise gossip, then a
/// final anti-entropy pass so every replica must hold the same log.
pub async fn simulate_replication(config: &SimulationConfig) -> Result<SimulationStats, LogError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        OpLog Replication Simulation                        ║");
    println!("║  Replicas: {} | Appends/Replica: {} | Syncs: {} ║",
             config.replicas, config.ops_per_replica, config.syncs);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();

    let mut replicas = Vec::with_capacity(config.replicas);
    for _ in 0..config.replicas {
        replicas.push(Log::open(config.log_id.clone()).await?);
    }

    println!("\n[Phase 1/3] Appending entries on every replica...");

    let mut handles = vec![];
    for (idx, replica) in replicas.iter().enumerate() {
        let replica = replica.clone();
        let ops = config.ops_per_replica;
        let handle = tokio::spawn(async move {
            let writer = Ed25519Identity::generate();
            for i in 0..ops {
                replica.append(format!("replica {} op {}", idx, i), &writer).await?;
                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Ok::<_, LogError>(())
        });
        handles.push(handle);
    }

    for handle in handles {
        match handle.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "writer task failed"),
        }
    }

    println!("[Phase 1/3] ✓ Completed");
    println!("[Phase 2/3] Gossiping heads between random pairs...");

    let mut sync_times = vec![];
    let mut pairs = Box::pin(gossip_pairs(config.replicas, config.syncs, config.seed));
    let mut total_syncs = 0;
    while let Some((source, target)) = pairs.next().await {
        sync_pair(&replicas, source, target, config.syncs, &mut sync_times, &mut total_syncs).await?;
    }

    println!("[Phase 2/3] ✓ Completed");
    println!("[Phase 3/3] Anti-entropy pass...");

    // everything into replica 0, then replica 0 back out
    for idx in 1..replicas.len() {
        replicas[0].join_log(&replicas[idx]).await?;
    }
    for idx in 1..replicas.len() {
        replicas[idx].join_log(&replicas[0]).await?;
    }

    let expected = replicas.first().map(frontier).unwrap_or_default();
    let entries_per_replica = replicas.first().map_or(0, Log::len);
    let converged = replicas
        .iter()
        .all(|r| frontier(r) == expected && r.len() == entries_per_replica);

    let total_time = start.elapsed();

    let avg_sync_time = if !sync_times.is_empty() {
        sync_times.iter().sum::<Duration>() / sync_times.len() as u32
    } else {
        Duration::ZERO
    };

    let total_operations = (config.replicas * config.ops_per_replica) + total_syncs;
    let ops_per_second = total_operations as f64 / total_time.as_secs_f64();

    println!("[Phase 3/3] ✓ Completed");

    for replica in &replicas {
        replica.close().await?;
    }

    Ok(SimulationStats {
        num_replicas: config.replicas,
        operations_per_replica: config.ops_per_replica,
        total_syncs,
        entries_per_replica,
        converged,
        total_time,
        avg_sync_time,
        ops_per_second,
    })
}

/// Replication cost as the replica count grows
pub async fn simulate_scaling(max_replicas: usize, step_size: usize) -> Result<(), LogError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Sync Cost vs Replicas             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current_replicas = step_size;
    while current_replicas <= max_replicas {
        let config = SimulationConfig {
            replicas: current_replicas,
            ops_per_replica: 50,
            syncs: current_replicas * 20,
            ..SimulationConfig::default()
        };
        simulate_replication(&config).await?.print();
        current_replicas += step_size;
    }
    Ok(())
}
