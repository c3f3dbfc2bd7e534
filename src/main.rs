// src/main.rs
//! fleetd: the fleet supervisor
//!
//! Hosts the process manager, request router, and control API for one
//! machine's worth of agent workers.

use agent_fleet::router::{fallback_entry, FleetRouter, Resolver, RouteTable};
use agent_fleet::supervisor::{LogAggregator, ProcessManager, ProcessManagerConfig, SupervisorApi};
use agent_fleet::utils::config::SupervisorConfig;
use agent_fleet::utils::observability::init_tracing;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    info!("Starting fleetd v{}", agent_fleet::VERSION);

    let config = SupervisorConfig::load()?;
    info!("Configuration loaded: {:?}", config);

    let logs = Arc::new(LogAggregator::default());
    let routes = RouteTable::new();

    let manager_config = ProcessManagerConfig {
        port_range_start: config.fleet.port_range_start,
        port_range_end: config.fleet.port_range_end,
        monitor_interval: Duration::from_secs(config.fleet.monitor_interval_secs),
        stop_timeout: Duration::from_secs(config.fleet.stop_timeout_secs),
        worker_program: config.fleet.worker_program.clone(),
        worker_args: Vec::new(),
        control_plane_url: config.fleet.control_plane_url.clone(),
    };
    let manager = Arc::new(ProcessManager::new(
        manager_config,
        Arc::clone(&logs),
        routes.clone(),
    ));
    manager.start_monitor();

    let fallback = config
        .fleet
        .fallback_endpoint
        .as_deref()
        .and_then(fallback_entry);
    let resolver = Arc::new(Resolver::new(routes, None, fallback));
    let router = Arc::new(FleetRouter::new(resolver));
    let api = Arc::new(SupervisorApi::new(manager, logs));

    let control_addr: SocketAddr =
        format!("{}:{}", config.server.host, config.server.port).parse()?;
    let router_addr: SocketAddr =
        format!("{}:{}", config.server.host, config.server.router_port).parse()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut router_shutdown = shutdown_rx.clone();
    let mut api_shutdown = shutdown_rx;

    let router_task = tokio::spawn(async move {
        router
            .serve(router_addr, async move {
                let _ = router_shutdown.changed().await;
            })
            .await
    });
    let api_task = tokio::spawn(async move {
        api.serve(control_addr, async move {
            let _ = api_shutdown.changed().await;
        })
        .await
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, cleaning up");
    let _ = shutdown_tx.send(true);

    for (name, task) in [("router", router_task), ("control API", api_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} exited with error: {}", name, e),
            Err(e) => error!("{} task panicked: {}", name, e),
        }
    }

    info!("fleetd stopped");
    Ok(())
}
