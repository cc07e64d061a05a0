//! Fleet Node Agent
//!
//! Recovers the instances persisted on this node, reconciles them with the
//! runtime and keeps their event outboxes draining until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_node_agent::state::StateStore;
use fleet_node_agent::{Agent, Config, ControlPlaneClient, LifecycleContext, MockRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        control_plane_url = %config.control_plane_url,
        data_dir = %config.data_dir.display(),
        "Starting fleet node agent"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = StateStore::open(config.state_db_path()).context("failed to open state store")?;

    let client = Arc::new(ControlPlaneClient::new(&config)?);

    // Create the runtime (mock for now)
    let runtime = Arc::new(MockRuntime::new());

    let ctx = LifecycleContext {
        store: Arc::new(store),
        runtime,
        bus: client.clone(),
        replicator: client,
        config: config.lifecycle.clone(),
    };

    let agent = Agent::new(config.node_id, ctx);
    let recovered = agent.recover().await?;
    info!(recovered, "Node agent ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    // Outboxes resume from the persisted cursor on next start.
    drop(agent);

    info!("Node agent shutdown complete");
    Ok(())
}
