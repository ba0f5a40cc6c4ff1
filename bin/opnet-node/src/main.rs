//! The OP_NET node binary.

use clap::Parser;
use opnet_config::NodeConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod adapters;
mod node;

#[derive(Debug, Parser)]
#[command(name = "opnet-node", about = "OP_NET Bitcoin L2 indexing and execution core")]
struct Cli {
    /// Path to the YAML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => {
            tracing::info!(target: "opnet::node", "no config file given; using defaults");
            NodeConfig::default()
        }
    };

    let node = node::Node::launch(config).await?;
    wait_for_shutdown_signal().await;
    tracing::info!(target: "opnet::node", "shutdown signal received; draining");
    node.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
