//! Tessera Node - BFT consensus committee runner.
//!
//! Hosts one or more committee members in a single process and runs them
//! over an in-memory network until interrupted or a target height is hit.

use anyhow::bail;
use clap::Parser;
use std::path::PathBuf;

mod config;
mod observability;
mod runner;

use config::{generate_devnet, NodeConfig};
use runner::LocalCommittee;

/// Tessera Node - HotStuff-style consensus for permissioned committees
#[derive(Parser, Debug)]
#[command(name = "tessera-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (.yaml, .yml or .json)
    #[arg(short, long, conflicts_with = "devnet")]
    config: Option<PathBuf>,

    /// Run a devnet with this many members, all hosted locally
    #[arg(long)]
    devnet: Option<u64>,

    /// Write the generated devnet configuration to this path and exit
    #[arg(long, requires = "devnet")]
    write_config: Option<PathBuf>,

    /// Stop once this many payloads are committed
    #[arg(long)]
    rounds: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init_logging(&args.log_level, args.json_logs);

    let config = match (&args.config, args.devnet) {
        (Some(path), _) => NodeConfig::load(path)?,
        (None, Some(members)) => {
            let config = generate_devnet(members);
            config.validate()?;
            config
        }
        (None, None) => bail!("either --config or --devnet is required"),
    };

    if let Some(path) = &args.write_config {
        config.save_yaml(path)?;
        tracing::info!(path = %path.display(), "devnet configuration written");
        return Ok(());
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        network = %config.network,
        "Starting Tessera node"
    );

    let mut committee = LocalCommittee::start(&config)?;
    committee.run_until(args.rounds).await;

    if let Some(engine) = committee.engines().first() {
        tracing::debug!(metrics = %engine.metrics().encode(), "final metrics");
    }
    committee.shutdown().await?;

    tracing::info!("Tessera node stopped");
    Ok(())
}
