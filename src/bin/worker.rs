// src/bin/worker.rs
//! fleet-worker: one agent worker process
//!
//! Spawned by fleetd with its configuration in `FLEET_*` environment
//! variables. Boots the package, serves the RPC/HTTP/UI surfaces, and
//! drains on SIGTERM. Exits non-zero on any boot failure so the
//! supervisor's restart policy can react.

use agent_fleet::loader::registry::HandlerRegistry;
use agent_fleet::runtime::{RuntimeConfig, RuntimeLifecycleController};
use agent_fleet::utils::observability::init_tracing;
use anyhow::Result;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid worker configuration: {}", e);
            std::process::exit(2);
        }
    };
    info!(
        "Starting fleet-worker v{} for agent {} (http {}, rpc {})",
        agent_fleet::VERSION,
        config.agent_id,
        config.http_port,
        config.rpc_port
    );

    let registry = HandlerRegistry::with_builtins();
    let mut controller = RuntimeLifecycleController::new(config, registry);

    if let Err(e) = controller.run().await {
        error!("Worker failed: {}", e);
        std::process::exit(1);
    }

    info!("Worker stopped");
    Ok(())
}
