//! Controller manager.
//!
//! Owns the store watch and fans events out to the reconcilers' work
//! queues, keeps the correlation index current and runs the periodic
//! resync. Each reconciler runs under its own [`Controller`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vscan_api::{LabelSelector, ObjectKey, Resource, ResourceKind, ScanJob};
use vscan_messaging::TaskPublisher;
use vscan_reconcile::{BackoffPolicy, Controller, ControllerConfig, WorkQueue};
use vscan_store::{Client, WatchEvent, WatchEventType};

use crate::catalog::RegistryCatalog;
use crate::error::ControllerResult;
use crate::index::CorrelationIndex;
use crate::report::ReportReconciler;
use crate::scanjob::{JobReconciler, JobReconcilerConfig};

/// Manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Concurrent reconciles per controller.
    pub workers: usize,
    /// Period of the full resync.
    pub resync_interval: Duration,
    /// Requeue backoff for failed reconciles.
    pub backoff: BackoffPolicy,
    /// Time allowed for in-flight publishes at shutdown.
    pub drain_timeout: Duration,
    pub job: JobReconcilerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_interval: vscan_reconcile::DEFAULT_RESYNC_INTERVAL,
            backoff: BackoffPolicy::default(),
            drain_timeout: Duration::from_secs(10),
            job: JobReconcilerConfig::default(),
        }
    }
}

pub struct Manager {
    client: Client,
    publisher: TaskPublisher,
    index: Arc<CorrelationIndex>,
    jobs: Arc<JobReconciler>,
    reports: Arc<ReportReconciler>,
    job_queue: WorkQueue<ObjectKey>,
    report_queue: WorkQueue<ObjectKey>,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(
        client: Client,
        publisher: TaskPublisher,
        catalog: Arc<dyn RegistryCatalog>,
        config: ManagerConfig,
    ) -> Self {
        let index = Arc::new(CorrelationIndex::new());
        let jobs = Arc::new(JobReconciler::new(
            client.clone(),
            publisher.clone(),
            catalog,
            Arc::clone(&index),
            config.job.clone(),
        ));
        let reports = Arc::new(ReportReconciler::new(
            client.clone(),
            Arc::clone(&index),
            config.job.budget(),
        ));
        Self {
            client,
            publisher,
            index,
            jobs,
            reports,
            job_queue: WorkQueue::new(config.backoff.clone()),
            report_queue: WorkQueue::new(config.backoff.clone()),
            config,
        }
    }

    pub fn index(&self) -> &Arc<CorrelationIndex> {
        &self.index
    }

    /// Run until `shutdown` flips to true.
    ///
    /// Fails only if the initial sync with the store fails. In-flight
    /// reconciles finish while the publisher drains; publishes still
    /// retrying after the drain timeout are cancelled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ControllerResult<()> {
        // Subscribe before listing so nothing falls between the two.
        let mut events = self.client.watch();
        self.index.rebuild(&self.client).await?;
        self.enqueue_jobs().await?;

        let controller_config = ControllerConfig {
            workers: self.config.workers,
        };
        let job_controller = Controller::new(
            Arc::clone(&self.jobs),
            self.job_queue.clone(),
            controller_config.clone(),
        );
        let report_controller = Controller::new(
            Arc::clone(&self.reports),
            self.report_queue.clone(),
            controller_config,
        );
        let handles = [
            tokio::spawn(job_controller.run(shutdown.clone())),
            tokio::spawn(report_controller.run(shutdown.clone())),
        ];

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        resync.tick().await;

        info!(
            jobs = self.job_queue.len(),
            correlated_jobs = self.index.len(),
            "Controller manager started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = resync.tick() => {
                    debug!("Periodic resync");
                    self.jobs.prune();
                    if let Err(e) = self.enqueue_jobs().await {
                        warn!(error = %e, "Resync failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.route(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch fell behind, rebuilding correlation index");
                        if let Err(e) = self.index.rebuild(&self.client).await {
                            warn!(error = %e, "Index rebuild failed, retrying at next resync");
                        }
                        if let Err(e) = self.enqueue_jobs().await {
                            warn!(error = %e, "Failed to requeue jobs");
                        }
                    }
                    Err(RecvError::Closed) => {
                        error!("Store watch closed");
                        break;
                    }
                },
            }
        }

        info!("Controller manager shutting down");
        self.job_queue.shutdown();
        self.report_queue.shutdown();

        // Reconcilers blocked in publish retries finish once the drain
        // cancels them, so both run side by side.
        let controllers = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Controller task panicked");
                }
            }
        };
        let drain = self.publisher.drain(self.config.drain_timeout);
        let (drained, ()) = tokio::join!(drain, controllers);
        info!(drained, "Controller manager stopped");
        Ok(())
    }

    /// Queue every ScanJob.
    async fn enqueue_jobs(&self) -> ControllerResult<()> {
        let jobs: Vec<ScanJob> = self.client.list(None, &LabelSelector::new()).await?;
        for job in jobs {
            self.job_queue.add(job.key());
        }
        Ok(())
    }

    fn route(&self, event: &WatchEvent) {
        let job = self.index.apply(event);
        match event.kind {
            ResourceKind::ScanJob => {
                if let Ok(key) = event.key() {
                    self.job_queue.add(key);
                }
            }
            ResourceKind::Sbom => {
                if let Some(job) = job {
                    self.job_queue.add(job.key);
                }
            }
            ResourceKind::VulnerabilityReport => {
                if let Some(job) = job {
                    self.job_queue.add(job.key);
                }
                if event.event_type != WatchEventType::Deleted {
                    if let Ok(key) = event.key() {
                        self.report_queue.add(key);
                    }
                }
            }
            ResourceKind::Registry | ResourceKind::VexHub => {}
        }
    }
}
