//! vscan worker
//!
//! Runs a pool of scan consumers. Without an external store and bus client
//! the worker only runs in dev mode, where it seeds an embedded store,
//! publishes one task per seeded SBOM and exits once every task settled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vscan_api::{LabelSelector, VulnerabilityReport};
use vscan_messaging::{MemoryBus, MemoryBusConfig, PublisherConfig, TaskPublisher};
use vscan_store::{Client, MemoryStore};
use vscan_worker::{seed::Seed, Config, ScanSbomHandler, TrivyScanner, WorkerPool};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to VSCAN_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vscan worker");
    info!(
        bus_url = %config.bus.url,
        work_dir = %config.work_dir.display(),
        scanner = %config.scanner_path.display(),
        concurrency = config.concurrency,
        "Configuration loaded"
    );

    if !config.dev_mode {
        error!("No external store or bus client is available");
        bail!("set VSCAN_DEV=1 to run against the embedded store and bus");
    }
    config.prepare_dirs()?;

    let client = Client::new(Arc::new(MemoryStore::new()));
    let bus = MemoryBus::new(MemoryBusConfig::default());

    let tasks = match &config.seed_file {
        Some(path) => Seed::load(path)?.apply(&client).await?,
        None => Vec::new(),
    };
    let publisher = TaskPublisher::new(Arc::new(bus.clone()), PublisherConfig::default());
    for task in &tasks {
        publisher.publish_scan(task).await?;
    }

    let scanner = Arc::new(TrivyScanner::new(config.scanner()));
    let handler = Arc::new(ScanSbomHandler::new(client.clone(), scanner, config.work_dir.clone()));
    let pool = WorkerPool::new(Arc::new(bus.clone()), handler, config.pool());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut pool_handle = tokio::spawn(pool.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = settled(&bus) => {
            info!("All tasks settled");
        }
        result = &mut pool_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
    }

    shutdown_tx.send_replace(true);
    bus.close();

    let shutdown_timeout = Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, pool_handle).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "Worker pool failed"),
        Ok(Err(e)) => warn!(error = %e, "Worker pool panicked"),
        Err(_) => warn!("Worker pool did not shut down in time"),
        Ok(Ok(Ok(()))) => {}
    }

    let reports: Vec<VulnerabilityReport> = client.list(None, &LabelSelector::new()).await?;
    info!(
        tasks = tasks.len(),
        reports = reports.len(),
        stats = ?bus.stats(),
        "Worker shutdown complete"
    );
    Ok(())
}

/// Resolves once the bus holds no unsettled message.
async fn settled(bus: &MemoryBus) {
    while !bus.is_idle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
