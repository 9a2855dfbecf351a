//! vscan controller
//!
//! Runs the ScanJob and VulnerabilityReport reconcilers. Without an
//! external store and bus client the controller only runs in dev mode,
//! where store, bus, registry catalog and a scan worker pool all live in
//! this process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vscan_controller::{config::Config, seed::Seed, Manager, StaticCatalog};
use vscan_messaging::{MemoryBus, MemoryBusConfig, PublisherConfig, TaskPublisher};
use vscan_store::{Client, MemoryStore};
use vscan_worker::{ScanSbomHandler, TrivyScanner, WorkerPool};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to VSCAN_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vscan controller");
    info!(
        bus_url = %config.bus.url,
        metrics_addr = %config.metrics_addr,
        health_addr = %config.health_addr,
        concurrency = config.concurrency,
        max_task_attempts = config.max_task_attempts,
        "Configuration loaded"
    );

    if !config.dev_mode {
        error!("No external store or bus client is available");
        bail!("set VSCAN_DEV=1 to run against the embedded store and bus");
    }
    if config.leader_elect {
        warn!("Leader election needs a shared store, running as the only instance");
    }

    let client = Client::new(Arc::new(MemoryStore::new()));
    let bus = MemoryBus::new(MemoryBusConfig::default());
    let catalog = Arc::new(StaticCatalog::new());

    if let Some(path) = &config.seed_file {
        Seed::load(path)?.apply(&client, &catalog).await?;
    }

    // Embedded worker, scanning with the local scanner binary
    let worker_config = vscan_worker::Config::from_env()?;
    worker_config.prepare_dirs()?;
    let scanner = Arc::new(TrivyScanner::new(worker_config.scanner()));
    let handler = Arc::new(ScanSbomHandler::new(
        client.clone(),
        scanner,
        worker_config.work_dir.clone(),
    ));
    let pool = WorkerPool::new(Arc::new(bus.clone()), handler, worker_config.pool());

    let publisher = TaskPublisher::new(Arc::new(bus.clone()), PublisherConfig::default());
    let manager = Manager::new(client.clone(), publisher, catalog, config.manager());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            if let Err(e) = pool.run(shutdown_rx).await {
                error!(error = %e, "Worker pool failed");
            }
        }
    });

    let mut manager_handle = tokio::spawn(manager.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut manager_handle => {
            shutdown_tx.send_replace(true);
            bus.close();
            let _ = tokio::time::timeout(Duration::from_secs(10), pool_handle).await;
            return match result {
                Ok(Ok(())) => {
                    info!("Controller manager exited");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Controller manager failed");
                    Err(e.into())
                }
                Err(e) => {
                    error!(error = %e, "Controller manager panicked");
                    Err(e.into())
                }
            };
        }
    }

    // Signal shutdown to manager and workers
    shutdown_tx.send_replace(true);

    info!("Waiting for components to shut down...");
    let shutdown_timeout = Duration::from_secs(15);

    match tokio::time::timeout(shutdown_timeout, manager_handle).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "Controller manager failed during shutdown"),
        Ok(Err(e)) => warn!(error = %e, "Controller manager panicked"),
        Err(_) => warn!("Controller manager did not shut down in time"),
        Ok(Ok(Ok(()))) => {}
    }

    bus.close();
    if tokio::time::timeout(shutdown_timeout, pool_handle).await.is_err() {
        warn!("Worker pool did not shut down in time");
    }

    info!(stats = ?bus.stats(), "Controller shutdown complete");
    Ok(())
}
