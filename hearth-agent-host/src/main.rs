//! Hearth Agent Host - node agent for game server fleets
//!
//! Runs on every node and drives the local container runtime for the kernel:
//! - Persistent control channel with automatic reconnection
//! - Host metrics heartbeat and container inventory sync
//! - Container lifecycle, RCON, world backups and log streaming
//! - A2S queries for player counts and server version

mod backup;
mod config;
mod discovery;
mod execution;
mod inventory;
mod logs;
mod metrics;
mod query;
mod rcon;
mod runtime;
mod transport;

use anyhow::{Context, Result};
use config::AgentConfig;
use discovery::SystemInfo;
use execution::CommandExecutor;
use runtime::DockerCli;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use transport::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hearth_agent_host=info")),
        )
        .init();

    info!("🔥 Hearth Agent Host v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(AgentConfig::load().await.context("Failed to load agent configuration")?);
    info!(
        "Node {} ({}) -> kernel {}, data in {}",
        config.node_name,
        config.node_address,
        config.backend_addr,
        config.data_path.display()
    );

    let system = SystemInfo::discover().await;
    let runtime = Arc::new(DockerCli::new(config.docker_bin.clone()));
    let executor = CommandExecutor::new(runtime, config.clone());
    let agent = Agent::new(config, system, executor);

    tokio::select! {
        _ = agent.run_forever() => {}
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested, stopping agent");
        }
    }

    Ok(())
}
