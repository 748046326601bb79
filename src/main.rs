//! causeway - causal state replication across server processes.
//!
//! Runs an in-process cluster over the connection fabric: servers edit a
//! shared document, broadcast patch messages and versioned states, and merge
//! until every replica converges.

mod config;
mod simulation;

use crate::config::CausewayConfig;
use clap::{Parser, Subcommand};
use simulation::{run_failover, run_simulation};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "causeway")]
#[command(about = "Causal state replication over a distributed connection fabric")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Servers edit a shared document, replicate over the fabric and converge
    Simulate {
        /// Override the number of servers
        #[arg(long)]
        servers: Option<usize>,
        /// Seed for reproducible edits
        #[arg(long)]
        seed: Option<u64>,
    },
    /// A server stops heartbeating and the survivors purge it
    Failover,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => CausewayConfig::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load config");
            e
        })?,
        None => CausewayConfig::default(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command.unwrap_or(Commands::Simulate { servers: None, seed: None }) {
            Commands::Simulate { servers, seed } => {
                if let Some(servers) = servers {
                    config.simulation.servers = servers;
                }
                if seed.is_some() {
                    config.simulation.seed = seed;
                }
                config.validate()?;
                info!(servers = config.simulation.servers, "starting simulation");

                let stats = run_simulation(&config).await?;
                stats.print();
                if !stats.converged {
                    anyhow::bail!("replicas did not converge");
                }
                println!("\n✓ All replicas converged");
            }
            Commands::Failover => {
                run_failover(&config).await?;
            }
        }
        Ok(())
    })
}
