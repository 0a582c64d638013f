//! Timelock Node
//!
//! Runs one member of a timelock cluster from a JSON install config.
//!
//! # Usage
//!
//! ```bash
//! TIMELOCK_CONFIG=/etc/timelock/timelock.json TIMELOCK_NODE_ID=1 \
//!   RUST_LOG=timelock=debug timelock-node
//! ```
//!
//! The embedded node serves a single-member cluster (Paxos or KV mode).
//! Multi-member clusters embed [`timelock::node::TimelockNode`] behind a
//! transport that supplies `AcceptorClient`s for the peers.

use std::env;

use timelock::config::TimelockConfig;
use timelock::node::TimelockNode;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("timelock=info".parse()?),
        )
        .init();

    let config_path = env::var("TIMELOCK_CONFIG").unwrap_or_else(|_| "./timelock.json".to_string());
    let config = TimelockConfig::load(&config_path)?;
    let servers = config.servers()?;

    tracing::info!(
        "Starting Timelock Node\n  Node ID: {}\n  Config: {}\n  Members: {}",
        config.cluster.local_node_id,
        config_path,
        servers
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    if config.cluster.tls.is_some() {
        tracing::warn!("TLS settings are passed to the transport, which this binary does not run");
    }

    let node = TimelockNode::from_config(&config, Vec::new())
        .map_err(|e| format!("Failed to create timelock node: {}", e))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = node.start(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("background task ended abnormally: {}", e);
        }
    }
    tracing::info!("Timelock node stopped");
    Ok(())
}
