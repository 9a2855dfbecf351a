//! VulnerabilityReport reconciler.
//!
//! Propagates report arrivals to the status of the ScanJob named by the
//! report's correlation labels. Reports themselves are never modified.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};
use vscan_api::{ObjectKey, ScanJob, VulnerabilityReport};
use vscan_reconcile::{Action, Reconciler};
use vscan_store::Client;

use crate::error::{ControllerError, ControllerResult};
use crate::index::{CorrelationIndex, JobRef};
use crate::status::{self, DispatchBudget};

pub struct ReportReconciler {
    client: Client,
    index: Arc<CorrelationIndex>,
    budget: DispatchBudget,
}

impl ReportReconciler {
    pub fn new(client: Client, index: Arc<CorrelationIndex>, budget: DispatchBudget) -> Self {
        Self {
            client,
            index,
            budget,
        }
    }
}

#[async_trait]
impl Reconciler for ReportReconciler {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn name(&self) -> &'static str {
        "vulnerabilityreport"
    }

    #[instrument(skip(self))]
    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action> {
        let Some(report) = self.client.get_opt::<VulnerabilityReport>(key).await? else {
            return Ok(Action::await_change());
        };
        let Some(job_ref) = JobRef::from_labels(&report.metadata) else {
            debug!("Report carries no scan job labels");
            return Ok(Action::await_change());
        };
        let Some(job) = self.client.get_opt::<ScanJob>(&job_ref.key).await? else {
            debug!(scan_job = %job_ref.key, "Owning ScanJob gone");
            return Ok(Action::await_change());
        };
        if job.metadata.uid != Some(job_ref.uid) {
            debug!(scan_job = %job_ref.key, "Report belongs to an earlier ScanJob of the same name");
            return Ok(Action::await_change());
        }

        // Make sure this report counts even if its watch event is still queued.
        self.index.observe(&report);
        let progress = self.index.progress(&job_ref.uid);
        let now = Utc::now();
        let updated: ScanJob = self
            .client
            .update_status_with(&job_ref.key, |j: &mut ScanJob| {
                j.status = status::aggregate(&j.status, progress, &self.budget, now);
            })
            .await?;

        debug!(
            scan_job = %job_ref.key,
            phase = %updated.status.phase,
            scanned = updated.status.scanned_images_count,
            images = updated.status.images_count,
            "ScanJob status refreshed"
        );
        Ok(Action::await_change())
    }
}
