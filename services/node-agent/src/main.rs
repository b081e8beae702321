//! KVM Node Agent
//!
//! Tracks live domain migrations on this host and mirrors their progress
//! into migration records.
//!
//! ## Architecture
//!
//! - **Event Multiplexer**: Subscribes to daemon event categories
//! - **Handlers**: Start, stop and finalize migration watches
//! - **Watch Registry**: One polling watcher per migrating domain
//! - **Daemon**: Abstracts the virtualization daemon (emulated in dev)

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kvm_node_agent::config::Config;
use kvm_node_agent::migration::WatchContext;
use kvm_node_agent::{
    DomainInventory, EmulatedDaemon, MigrationAgent, MigrationWatchRegistry, SqliteRecordStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting KVM node agent");
    info!(
        host_id = %config.host_id,
        data_dir = %config.data_dir.display(),
        poll_interval = ?config.poll_interval,
        watch_timeout_secs = config.watch_timeout.as_secs(),
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = Arc::new(
        SqliteRecordStore::open(config.record_db_path())
            .context("failed to open migration record store")?,
    );

    // Create the daemon client (emulated for now)
    let daemon = Arc::new(EmulatedDaemon::new());

    let inventory = Arc::new(DomainInventory::new());
    let registry = MigrationWatchRegistry::new(WatchContext {
        daemon: daemon.clone(),
        store,
        inventory: inventory.clone(),
        host: config.host_id.clone(),
        settings: config.watch_settings(),
    });

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let agent = MigrationAgent::new(daemon, registry, inventory, config.reconnect_delay);
    let mut agent_handle = tokio::spawn(agent.run(shutdown_rx));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut agent_handle => {
            if let Err(e) = result {
                error!(error = %e, "Migration agent task panicked");
            }
            return Ok(());
        }
    }

    // Signal shutdown to the agent
    let _ = shutdown_tx.send(true);
    if let Err(e) = agent_handle.await {
        error!(error = %e, "Migration agent task panicked");
    }

    info!("Node agent shutdown complete");
    Ok(())
}
