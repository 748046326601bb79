use crate::config::CausewayConfig;
use anyhow::{anyhow, Context};
use async_stream::stream;
use causeway_delta::DeltaSyncEngine;
use causeway_fabric::{
    DistributedConnectionManager, DistributedStats, FabricPayload, MemoryLocalRegistry,
    MemoryStore,
};
use causeway_state::{StateConfig, StateManager, VersionedState};
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DOC_ROOM: &str = "doc";
const REPLICA_ROOM: &str = "replicas";

/// Statistics collected during a replication run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub servers: usize,
    pub clients: usize,
    pub edits: usize,
    pub states_merged: usize,
    pub conflicts: usize,
    pub patches_delivered: usize,
    pub compressed_messages: usize,
    pub snapshots: usize,
    pub snapshot_bytes: usize,
    pub total_time: Duration,
    pub avg_merge_time: Duration,
    pub converged: bool,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Replication Statistics                        ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Servers:                   {:>30} ║", self.servers);
        println!("║  Client Connections:        {:>30} ║", self.clients);
        println!("║  Local Edits:               {:>30} ║", self.edits);
        println!("║  Remote States Merged:      {:>30} ║", self.states_merged);
        println!("║  Merge Conflicts:           {:>30} ║", self.conflicts);
        println!("║  Patch Messages Delivered:  {:>30} ║", self.patches_delivered);
        println!("║  Compressed Messages:       {:>30} ║", self.compressed_messages);
        println!("║  Snapshots / Bytes:         {:>30} ║", format!("{} / {}", self.snapshots, self.snapshot_bytes));
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Merge Time:        {:>28}µs ║", self.avg_merge_time.as_micros());
        println!("║  Converged:                 {:>30} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// One local edit: `server` sets its field `field` to `value`.
#[derive(Clone, Debug)]
struct Edit {
    server: usize,
    field: String,
    value: u64,
}

/// Yields edits round-robin across servers
fn edit_generator(servers: usize, edits_per_server: usize, seed: Option<u64>) -> impl Stream<Item = Edit> {
    stream! {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        for _ in 0..edits_per_server {
            for server in 0..servers {
                yield Edit {
                    server,
                    field: format!("k{}", rng.gen_range(0..8)),
                    value: rng.gen_range(0..10_000),
                };
            }
        }
    }
}

/// A simulated server process: fabric node, replica of the document, and
/// the delta engine that produces its outgoing patch messages.
struct Server {
    id: String,
    fabric: Arc<DistributedConnectionManager>,
    registry: MemoryLocalRegistry,
    state: StateManager,
    engine: DeltaSyncEngine,
    clients: Vec<String>,
    /// Replica states already consumed from this server's inbox.
    consumed: usize,
}

impl Server {
    fn replica_connection(&self) -> String {
        format!("{}/replica", self.id)
    }

    async fn start(config: &CausewayConfig, store: &MemoryStore, index: usize) -> anyhow::Result<Self> {
        let id = format!("server-{}", index);
        let mut fabric_config = config.fabric.clone();
        fabric_config.server_id = id.clone();
        let registry = MemoryLocalRegistry::new();
        let fabric = Arc::new(
            DistributedConnectionManager::new(
                fabric_config,
                Arc::new(store.connect()),
                Arc::new(registry.clone()),
            )
            .await?,
        );
        fabric.start().await?;

        let state = StateManager::with_config(StateConfig {
            writer_id: id.clone(),
            ..config.state.clone()
        });
        let mut server = Server {
            id,
            fabric,
            registry,
            state,
            engine: DeltaSyncEngine::with_config(config.engine.clone()),
            clients: Vec::new(),
            consumed: 0,
        };

        let replica = server.replica_connection();
        server.fabric.register_connection(&replica, &server.id).await?;
        server.fabric.join_room(&replica, REPLICA_ROOM).await?;
        for c in 0..config.simulation.clients_per_server {
            let client = format!("{}/client-{}", server.id, c);
            server.fabric.register_connection(&client, &format!("user-{}-{}", index, c)).await?;
            server.fabric.join_room(&client, DOC_ROOM).await?;
            server.clients.push(client);
        }
        Ok(server)
    }

    /// Apply a local edit and publish both the patch and the new state.
    async fn edit(&mut self, edit: &Edit) -> anyhow::Result<bool> {
        let head = self
            .state
            .head()
            .cloned()
            .ok_or_else(|| anyhow!("{} has no state", self.id))?;
        let id = self.id.clone();
        let next = self.state.update_state(&head.id, |doc| {
            doc["servers"][id.as_str()][edit.field.as_str()] = json!(edit.value);
        })?;

        let message = self
            .engine
            .create_patch_message(&head.data, &next.data, &head.version, &next.version)?;
        let compressed = message.compressed;
        self.fabric
            .broadcast_to_room(DOC_ROOM, FabricPayload::Patch(message))
            .await?;
        self.fabric
            .broadcast_to_room(REPLICA_ROOM, FabricPayload::State(next))
            .await?;
        Ok(compressed)
    }

    /// Wait until `expected` replica states have arrived, then fold every
    /// unseen one into the head. Returns (states merged, conflicts, merge times).
    async fn absorb(&mut self, expected: usize, timeout: Duration) -> anyhow::Result<(usize, usize, Vec<Duration>)> {
        let replica = self.replica_connection();
        let received = tokio::time::timeout(timeout, self.registry.wait_for(&replica, expected))
            .await
            .map_err(|_| anyhow!("{} did not receive {} replica states in time", self.id, expected))?;

        let mut merged = 0;
        let mut conflicts = 0;
        let mut times = Vec::new();
        for payload in received.into_iter().skip(self.consumed) {
            self.consumed += 1;
            let FabricPayload::State(remote) = payload else {
                continue;
            };
            // Local delivery hands a server its own states back.
            if self.state.get_state(&remote.id).is_some() {
                continue;
            }
            let start = Instant::now();
            let result = self.state.reconcile_remote_state(remote)?;
            times.push(start.elapsed());
            conflicts += result.conflicts.len();
            merged += 1;
        }
        Ok((merged, conflicts, times))
    }
}

/// Run servers sharing one in-memory store: every server edits its own
/// part of a shared document, replicates over the fabric, and merges.
pub async fn run_simulation(config: &CausewayConfig) -> anyhow::Result<SimulationStats> {
    let sim = &config.simulation;
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Replication Simulation                              ║");
    println!("║  Servers: {} | Clients/Server: {} | Edits/Server: {} ║",
             sim.servers, sim.clients_per_server, sim.edits_per_server);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let settle = Duration::from_millis(sim.settle_timeout_ms);
    let store = MemoryStore::new();

    let mut servers = Vec::with_capacity(sim.servers);
    for index in 0..sim.servers {
        servers.push(Server::start(config, &store, index).await?);
    }

    println!("\n[Phase 1/3] Bootstrapping replicas...");
    let root: VersionedState = servers[0]
        .state
        .create_state(json!({"title": "shared document", "servers": {}}))?;
    for server in servers.iter().skip(1) {
        servers[0]
            .fabric
            .send_to_connection(&server.replica_connection(), FabricPayload::State(root.clone()))
            .await?;
    }
    for server in servers.iter_mut().skip(1) {
        server.absorb(1, settle).await.context("bootstrap")?;
    }
    println!("[Phase 1/3] ✓ Completed");

    println!("[Phase 2/3] Editing and broadcasting...");
    let mut edits = 0;
    let mut compressed_messages = 0;
    let mut edit_gen = Box::pin(edit_generator(sim.servers, sim.edits_per_server, sim.seed));
    while let Some(edit) = edit_gen.next().await {
        if servers[edit.server].edit(&edit).await? {
            compressed_messages += 1;
        }
        edits += 1;
        if edits % 100 == 0 {
            println!("  Edits completed: {}/{}", edits, sim.servers * sim.edits_per_server);
            tokio::task::yield_now().await;
        }
    }
    println!("[Phase 2/3] ✓ Completed");

    println!("[Phase 3/3] Merging replicas...");
    let all_edits = sim.servers * sim.edits_per_server;
    let mut states_merged = 0;
    let mut conflicts = 0;
    let mut merge_times = Vec::new();
    for (index, server) in servers.iter_mut().enumerate() {
        let bootstrap = usize::from(index > 0);
        let (merged, found, times) = server.absorb(bootstrap + all_edits, settle).await?;
        states_merged += merged;
        conflicts += found;
        merge_times.extend(times);
    }

    let heads: Vec<_> = servers
        .iter()
        .map(|s| s.state.head().map(|h| h.data.clone()))
        .collect();
    let converged = heads.windows(2).all(|pair| pair[0] == pair[1]);

    let mut snapshots = 0;
    let mut snapshot_bytes = 0;
    let mut patches_delivered = 0;
    for server in servers.iter_mut() {
        if let Some(head_id) = server.state.head_id().map(str::to_string) {
            server.state.create_snapshot(&head_id)?;
        }
        let stats = server.state.snapshots().stats();
        snapshots += stats.count;
        snapshot_bytes += stats.total_size;
        patches_delivered += server
            .clients
            .iter()
            .map(|c| server.registry.received(c).len())
            .sum::<usize>();
    }
    println!("[Phase 3/3] ✓ Completed");

    let cluster = servers[0].fabric.get_distributed_stats().await?;
    print_cluster(&cluster);

    for server in &servers {
        server.fabric.shutdown().await?;
    }

    let avg_merge_time = if !merge_times.is_empty() {
        merge_times.iter().sum::<Duration>() / merge_times.len() as u32
    } else {
        Duration::ZERO
    };

    Ok(SimulationStats {
        servers: sim.servers,
        clients: sim.servers * sim.clients_per_server,
        edits,
        states_merged,
        conflicts,
        patches_delivered,
        compressed_messages,
        snapshots,
        snapshot_bytes,
        total_time: start.elapsed(),
        avg_merge_time,
        converged,
    })
}

/// Stop one server's heartbeat and watch the others purge it.
pub async fn run_failover(config: &CausewayConfig) -> anyhow::Result<DistributedStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Failover Simulation                                 ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let store = MemoryStore::new();
    let mut fabric_config = config.fabric.clone();
    fabric_config.heartbeat_interval_ms = 50;
    fabric_config.heartbeat_ttl_ms = 150;
    fabric_config.failure_check_interval_ms = 50;

    // The doomed server registers once and never heartbeats again.
    let mut doomed_config = fabric_config.clone();
    doomed_config.server_id = "doomed".to_string();
    let doomed = DistributedConnectionManager::new(
        doomed_config,
        Arc::new(store.connect()),
        Arc::new(MemoryLocalRegistry::new()),
    )
    .await?;
    doomed.register_server().await?;
    for c in 0..config.simulation.clients_per_server.max(1) {
        let id = format!("doomed/client-{}", c);
        doomed.register_connection(&id, "user").await?;
        doomed.join_room(&id, DOC_ROOM).await?;
    }

    let mut survivor_config = fabric_config;
    survivor_config.server_id = "survivor".to_string();
    let survivor = Arc::new(
        DistributedConnectionManager::new(
            survivor_config,
            Arc::new(store.connect()),
            Arc::new(MemoryLocalRegistry::new()),
        )
        .await?,
    );
    survivor.start().await?;

    let before = survivor.get_distributed_stats().await?;
    println!("\n[Before] servers: {} | connections: {}", before.total_servers, before.total_connections);

    let deadline = Instant::now() + Duration::from_millis(config.simulation.settle_timeout_ms);
    let after = loop {
        let stats = survivor.get_distributed_stats().await?;
        if stats.total_servers == 1 || Instant::now() >= deadline {
            break stats;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    println!("[After]  servers: {} | connections: {}", after.total_servers, after.total_connections);

    survivor.shutdown().await?;
    if after.total_servers != 1 {
        return Err(anyhow!("failed server was not purged in time"));
    }
    println!("\n✓ Failed server and its connections were purged");
    Ok(after)
}

fn print_cluster(stats: &DistributedStats) {
    println!("\n  Cluster seen from {}: {}/{} servers live, {} connections, {} channels subscribed locally",
             stats.server_id, stats.live_servers, stats.total_servers,
             stats.total_connections, stats.subscribed_channels);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;

    fn small_config() -> CausewayConfig {
        CausewayConfig {
            simulation: SimulationConfig {
                servers: 3,
                clients_per_server: 1,
                edits_per_server: 5,
                seed: Some(42),
                settle_timeout_ms: 5_000,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_replicas_converge() {
        let stats = run_simulation(&small_config()).await.unwrap();
        assert!(stats.converged);
        assert_eq!(stats.edits, 15);
        assert_eq!(stats.conflicts, 0);
        // Each server merges every other server's edits plus the root.
        assert_eq!(stats.states_merged, 2 + 3 * 10);
        // Every client sees every edit.
        assert_eq!(stats.patches_delivered, 3 * 15);
    }

    #[tokio::test]
    async fn test_seeded_edits_are_reproducible() {
        let a: Vec<_> = edit_generator(2, 3, Some(1)).collect().await;
        let b: Vec<_> = edit_generator(2, 3, Some(1)).collect().await;
        assert_eq!(a.len(), 6);
        assert!(a
            .iter()
            .zip(&b)
            .all(|(x, y)| x.server == y.server && x.field == y.field && x.value == y.value));
    }

    #[tokio::test]
    async fn test_failover_purges_doomed_server() {
        let stats = run_failover(&small_config()).await.unwrap();
        assert_eq!(stats.total_servers, 1);
        assert_eq!(stats.total_connections, 0);
    }
}
