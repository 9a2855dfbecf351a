//! ScanJob reconciler.
//!
//! Drives a job through `Pending -> Running -> {Succeeded, Failed,
//! PartialFailure}`:
//!
//! 1. **Pending**: resolve the Registry, list its images, create one SBOM per
//!    eligible image and move to Running.
//! 2. **Running**: publish a scan task for every SBOM without a report,
//!    repeating for SBOMs still unscanned once per redispatch interval, and
//!    recompute the phase from the correlation index.
//! 3. **Terminal**: only the scanned-image count is kept current.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use vscan_api::{
    condition_reasons as reasons, LabelSelector, ObjectKey, Registry, Resource, Sbom, ScanJob,
    ScanJobPhase, ScanSbomMessage, LABEL_MANAGED_BY_KEY, LABEL_MANAGED_BY_VALUE,
    LABEL_PART_OF_KEY, LABEL_PART_OF_VALUE, LABEL_SCAN_JOB, LABEL_SCAN_JOB_UID,
};
use vscan_messaging::TaskPublisher;
use vscan_reconcile::{Action, ContentHash, ReconcileError, Reconciler, RetryTracker};
use vscan_store::Client;

use crate::catalog::{DiscoveredImage, RegistryCatalog};
use crate::error::{ControllerError, ControllerResult};
use crate::index::CorrelationIndex;
use crate::status::{self, DispatchBudget};

/// Job reconciler settings.
#[derive(Debug, Clone)]
pub struct JobReconcilerConfig {
    /// Dispatch rounds per job, the initial one included.
    pub max_task_attempts: u32,
    /// Time given to workers before unscanned SBOMs are dispatched again.
    pub task_redispatch_interval: Duration,
    /// Treat a registry without eligible images as a failure.
    pub fail_on_empty_registry: bool,
    /// Catalog failures tolerated per job within `catalog_retry_window`.
    pub catalog_retries: u32,
    pub catalog_retry_window: Duration,
}

impl Default for JobReconcilerConfig {
    fn default() -> Self {
        Self {
            max_task_attempts: 3,
            task_redispatch_interval: Duration::from_secs(10 * 60),
            fail_on_empty_registry: false,
            catalog_retries: vscan_reconcile::DEFAULT_MAX_RETRIES,
            catalog_retry_window: vscan_reconcile::DEFAULT_RETRY_WINDOW,
        }
    }
}

impl JobReconcilerConfig {
    pub fn budget(&self) -> DispatchBudget {
        DispatchBudget {
            max_task_attempts: self.max_task_attempts.max(1),
            redispatch_interval: self.task_redispatch_interval,
        }
    }
}

/// Deterministic SBOM name for an image discovered on behalf of a job.
///
/// Discovering the same image again for the same job yields the same name.
pub fn sbom_name(job: &ScanJob, image: &DiscoveredImage) -> String {
    let uid = job.metadata.uid.map(|u| u.to_string()).unwrap_or_default();
    let hash = ContentHash::from_json(&json!({
        "scanJob": uid,
        "image": image.metadata,
    }));
    format!("sbom-{}", hash.short(16))
}

pub struct JobReconciler {
    client: Client,
    publisher: TaskPublisher,
    catalog: Arc<dyn RegistryCatalog>,
    index: Arc<CorrelationIndex>,
    config: JobReconcilerConfig,
    catalog_failures: Mutex<RetryTracker>,
}

impl JobReconciler {
    pub fn new(
        client: Client,
        publisher: TaskPublisher,
        catalog: Arc<dyn RegistryCatalog>,
        index: Arc<CorrelationIndex>,
        config: JobReconcilerConfig,
    ) -> Self {
        let tracker = RetryTracker::new(config.catalog_retries, config.catalog_retry_window);
        Self {
            client,
            publisher,
            catalog,
            index,
            config,
            catalog_failures: Mutex::new(tracker),
        }
    }

    /// Drop expired catalog failure records.
    pub fn prune(&self) {
        self.tracker().prune();
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, RetryTracker> {
        self.catalog_failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fail(&self, job: &ScanJob, reason: &str, message: &str) -> ControllerResult<Action> {
        warn!(
            scan_job = %job.metadata.name,
            namespace = %job.metadata.namespace,
            reason,
            message,
            "ScanJob failed"
        );
        let now = Utc::now();
        self.client
            .update_status_with(&job.key(), |j: &mut ScanJob| {
                j.status = status::failed(&j.status, reason, message, now);
            })
            .await?;
        Ok(Action::await_change())
    }

    async fn reconcile_pending(&self, job: &ScanJob) -> ControllerResult<Action> {
        let job_key = job.key();
        let registry_key = ObjectKey::new(&job.metadata.namespace, &job.spec.registry);
        let Some(registry) = self.client.get_opt::<Registry>(&registry_key).await? else {
            let message = format!("registry {} not found", job.spec.registry);
            return self.fail(job, reasons::REGISTRY_NOT_FOUND, &message).await;
        };

        let images = match self.catalog.list_images(&registry).await {
            Ok(images) => {
                self.tracker().clear(&job_key.to_string());
                images
            }
            Err(e) => {
                let exhausted = self.tracker().record_failure(&job_key.to_string());
                if exhausted {
                    self.tracker().clear(&job_key.to_string());
                    return self
                        .fail(job, reasons::REGISTRY_UNREACHABLE, &e.to_string())
                        .await;
                }
                return Err(e.into());
            }
        };

        let eligible: Vec<DiscoveredImage> = images
            .into_iter()
            .filter(|image| registry.spec.admits(&image.metadata))
            .collect();
        info!(
            scan_job = %job.metadata.name,
            namespace = %job.metadata.namespace,
            registry = %registry.metadata.name,
            images = eligible.len(),
            "Discovered images"
        );

        let now = Utc::now();
        if eligible.is_empty() {
            let fail = self.config.fail_on_empty_registry;
            self.client
                .update_status_with(&job_key, |j: &mut ScanJob| {
                    if j.status.phase == ScanJobPhase::Pending {
                        j.status = status::empty(&j.status, fail, now);
                    }
                })
                .await?;
            return Ok(Action::await_change());
        }

        for image in &eligible {
            self.create_sbom(job, image).await?;
        }

        let count = eligible.len() as u32;
        self.client
            .update_status_with(&job_key, |j: &mut ScanJob| {
                if j.status.phase == ScanJobPhase::Pending {
                    j.status = status::running(&j.status, count, now);
                }
            })
            .await?;

        // Dispatch happens in the Running branch.
        Ok(Action::requeue(Duration::ZERO))
    }

    async fn create_sbom(&self, job: &ScanJob, image: &DiscoveredImage) -> ControllerResult<()> {
        let key = ObjectKey::new(&job.metadata.namespace, sbom_name(job, image));
        let uid = job.metadata.uid.map(|u| u.to_string()).unwrap_or_default();

        let (sbom, op) = self
            .client
            .create_or_update(&key, |sbom: &mut Sbom| {
                let labels = &mut sbom.metadata.labels;
                labels.insert(LABEL_SCAN_JOB.to_string(), job.metadata.name.clone());
                labels.insert(LABEL_SCAN_JOB_UID.to_string(), uid.clone());
                labels.insert(LABEL_MANAGED_BY_KEY.to_string(), LABEL_MANAGED_BY_VALUE.to_string());
                labels.insert(LABEL_PART_OF_KEY.to_string(), LABEL_PART_OF_VALUE.to_string());
                sbom.image_metadata = image.metadata.clone();
                sbom.spdx = image.spdx.clone();
                Ok(())
            })
            .await?;

        debug!(sbom = %key, image = %image.metadata.reference(), operation = %op, "SBOM ensured");
        self.index.observe(&sbom);
        Ok(())
    }

    async fn reconcile_running(&self, job: &ScanJob) -> ControllerResult<Action> {
        let Some(uid) = job.metadata.uid else {
            return Ok(Action::await_change());
        };
        let job_key = job.key();
        let budget = self.config.budget();
        let now = Utc::now();

        let progress = self.index.progress(&uid);
        let next = status::aggregate(&job.status, progress, &budget, now);
        if next.phase.is_terminal() {
            info!(
                scan_job = %job.metadata.name,
                namespace = %job.metadata.namespace,
                phase = %next.phase,
                scanned = progress.reports,
                images = job.status.images_count,
                "ScanJob finished"
            );
            self.write_aggregate(&job_key, progress).await?;
            return Ok(Action::await_change());
        }

        if budget.redispatch_due(&job.status, now) {
            if progress.sboms < job.status.images_count {
                self.confirm_missing_sboms(job, &uid, progress).await?;
            }
            let attempt = job.status.dispatch_attempts + 1;
            self.dispatch(job, &uid, attempt).await?;
            self.client
                .update_status_with(&job_key, |j: &mut ScanJob| {
                    j.status = status::dispatched(&j.status, attempt, now);
                })
                .await?;
            return Ok(Action::requeue(budget.redispatch_interval));
        }

        self.write_aggregate(&job_key, progress).await?;

        // Wake up when the current round ends.
        let wait = job
            .status
            .last_dispatch_time
            .map(|last| (budget.round_deadline(last) - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(budget.redispatch_interval);
        Ok(Action::requeue(wait))
    }

    /// The index knows fewer SBOMs than the job created. Either the index
    /// lags behind the store or SBOMs were deleted; the store decides.
    ///
    /// Deleted SBOMs never get a report, so the dispatch round proceeds
    /// and the job runs into its budget instead of waiting for them.
    async fn confirm_missing_sboms(
        &self,
        job: &ScanJob,
        uid: &vscan_api::ObjectUid,
        progress: status::Progress,
    ) -> ControllerResult<()> {
        let selector = LabelSelector::new().with_label(LABEL_SCAN_JOB_UID, uid.to_string());
        let stored: Vec<Sbom> = self
            .client
            .list(Some(job.metadata.namespace.as_str()), &selector)
            .await?;
        if stored.len() as u32 != progress.sboms {
            return Err(ReconcileError::NotSynced(job.key().to_string()).into());
        }
        warn!(
            scan_job = %job.metadata.name,
            namespace = %job.metadata.namespace,
            sboms = stored.len(),
            images = job.status.images_count,
            "SBOMs deleted while the ScanJob is running"
        );
        Ok(())
    }

    async fn dispatch(&self, job: &ScanJob, uid: &vscan_api::ObjectUid, attempt: u32) -> ControllerResult<()> {
        let unscanned = self.index.unscanned(uid);
        info!(
            scan_job = %job.metadata.name,
            namespace = %job.metadata.namespace,
            tasks = unscanned.len(),
            attempt,
            "Dispatching scan tasks"
        );
        for sbom in unscanned {
            let task = ScanSbomMessage::new(&job.metadata.name, sbom, &job.metadata.namespace);
            self.publisher.publish_scan(&task).await?;
        }
        Ok(())
    }

    async fn write_aggregate(&self, job_key: &ObjectKey, progress: status::Progress) -> ControllerResult<()> {
        let budget = self.config.budget();
        let now = Utc::now();
        self.client
            .update_status_with(job_key, |j: &mut ScanJob| {
                j.status = status::aggregate(&j.status, progress, &budget, now);
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for JobReconciler {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn name(&self) -> &'static str {
        "scanjob"
    }

    #[instrument(skip(self), fields(scan_job = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action> {
        let Some(job) = self.client.get_opt::<ScanJob>(key).await? else {
            debug!("ScanJob gone");
            self.tracker().clear(&key.to_string());
            return Ok(Action::await_change());
        };

        match job.status.phase {
            ScanJobPhase::Pending => self.reconcile_pending(&job).await,
            ScanJobPhase::Running => self.reconcile_running(&job).await,
            _ => {
                if let Some(uid) = job.metadata.uid {
                    self.write_aggregate(key, self.index.progress(&uid)).await?;
                }
                Ok(Action::await_change())
            }
        }
    }
}
