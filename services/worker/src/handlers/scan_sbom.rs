//! SBOM scan handler.
//!
//! Turns one [`ScanSbomMessage`] into one [`VulnerabilityReport`]:
//!
//! 1. Decode the task. A malformed payload is final.
//! 2. Load the ScanJob and the SBOM. Either one missing means the task is
//!    stale; it completes without a report.
//! 3. List the VEX hubs.
//! 4. Create a private workspace under the work directory: the SPDX input,
//!    the report output and the scanner home.
//! 5. Write the VEX descriptor into the home if any hub is enabled.
//! 6. Run the scanner.
//! 7. Read the report.
//! 8. Create or update the report named after the SBOM, controlled by it.
//!
//! The workspace is removed when it goes out of scope, which covers early
//! returns, errors and a dropped (cancelled) handler future alike.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, error, info, warn};
use vscan_api::{
    LabelSelector, Resource, Sbom, ScanJob, ScanSbomMessage, VexHub, VulnerabilityReport,
    LABEL_MANAGED_BY_KEY, LABEL_MANAGED_BY_VALUE, LABEL_PART_OF_KEY, LABEL_PART_OF_VALUE,
    LABEL_SCAN_JOB, LABEL_SCAN_JOB_UID, SCAN_SBOM_SUBJECT,
};
use vscan_store::{Client, OperationResult};

use super::Handler;
use crate::error::HandlerError;
use crate::scanner::{ScanInvocation, Scanner};
use crate::vex;

/// What a successfully handled task did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The ScanJob no longer exists.
    ScanJobGone,
    /// The SBOM no longer exists.
    SbomGone,
    /// The report was written (or already matched).
    Reported(OperationResult),
}

pub struct ScanSbomHandler {
    client: Client,
    scanner: Arc<dyn Scanner>,
    work_dir: PathBuf,
}

impl ScanSbomHandler {
    pub fn new(client: Client, scanner: Arc<dyn Scanner>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            scanner,
            work_dir: work_dir.into(),
        }
    }

    /// Runs steps 2 to 8 for an already decoded task.
    pub async fn process(&self, task: &ScanSbomMessage) -> Result<ScanOutcome, HandlerError> {
        let Some(job) = self.client.get_opt::<ScanJob>(&task.scan_job_key()).await? else {
            info!(
                scan_job = %task.scan_job_name,
                namespace = %task.sbom_namespace,
                "ScanJob not found, skipping task"
            );
            return Ok(ScanOutcome::ScanJobGone);
        };
        let Some(sbom) = self.client.get_opt::<Sbom>(&task.sbom_key()).await? else {
            info!(
                sbom = %task.sbom_name,
                namespace = %task.sbom_namespace,
                "SBOM not found, skipping task"
            );
            return Ok(ScanOutcome::SbomGone);
        };

        let hubs: Vec<VexHub> = self.client.list(None, &LabelSelector::new()).await?;

        let workspace = ScanWorkspace::create(&self.work_dir)?;
        let spdx = serde_json::to_vec(&sbom.spdx).map_err(HandlerError::Encode)?;
        tokio::fs::write(workspace.sbom.path(), spdx)
            .await
            .map_err(|source| HandlerError::io("failed to write SBOM file", source))?;

        let vex = vex::enrichment_enabled(&hubs);
        if vex {
            let path = vex::write_descriptor(workspace.home.path(), &hubs).await?;
            debug!(path = %path.display(), hubs = hubs.len(), "VEX repository descriptor written");
        }

        let invocation = workspace.invocation(vex);
        self.scanner.scan(&invocation).await?;
        debug!(sbom = %task.sbom_name, namespace = %task.sbom_namespace, "SBOM scanned");

        let raw = tokio::fs::read(&invocation.report_file)
            .await
            .map_err(|source| HandlerError::io("failed to read report file", source))?;
        let report: Value = serde_json::from_slice(&raw).map_err(HandlerError::InvalidReport)?;
        workspace.close();

        let job_uid = job.metadata.uid.map(|u| u.to_string()).unwrap_or_default();
        let key = sbom.key();
        let (_, op) = self
            .client
            .create_or_update(&key, |r: &mut VulnerabilityReport| {
                r.metadata.set_controller_reference(&sbom)?;
                let labels = &mut r.metadata.labels;
                labels.insert(LABEL_SCAN_JOB.to_string(), task.scan_job_name.clone());
                labels.insert(LABEL_SCAN_JOB_UID.to_string(), job_uid.clone());
                labels.insert(LABEL_MANAGED_BY_KEY.to_string(), LABEL_MANAGED_BY_VALUE.to_string());
                labels.insert(LABEL_PART_OF_KEY.to_string(), LABEL_PART_OF_VALUE.to_string());
                r.image_metadata = sbom.image_metadata.clone();
                r.report = report.clone();
                Ok(())
            })
            .await?;

        info!(
            scan_job = %task.scan_job_name,
            sbom = %task.sbom_name,
            namespace = %task.sbom_namespace,
            image = %sbom.image_metadata.reference(),
            vex,
            operation = %op,
            "Vulnerability report stored"
        );
        Ok(ScanOutcome::Reported(op))
    }
}

#[async_trait]
impl Handler for ScanSbomHandler {
    fn subject(&self) -> &str {
        SCAN_SBOM_SUBJECT
    }

    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let task = ScanSbomMessage::decode(payload).map_err(|e| {
            error!(error = %e, "Discarding malformed scan task");
            HandlerError::Malformed(e)
        })?;
        debug!(
            scan_job = %task.scan_job_name,
            sbom = %task.sbom_name,
            namespace = %task.sbom_namespace,
            "SBOM scan requested"
        );

        match self.process(&task).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(
                    scan_job = %task.scan_job_name,
                    sbom = %task.sbom_name,
                    namespace = %task.sbom_namespace,
                    error = %e,
                    "SBOM scan failed"
                );
                Err(e)
            }
        }
    }
}

/// Private scratch area for one scan, removed on drop.
struct ScanWorkspace {
    sbom: NamedTempFile,
    report: NamedTempFile,
    home: TempDir,
}

impl ScanWorkspace {
    fn create(work_dir: &Path) -> Result<Self, HandlerError> {
        let sbom = tempfile::Builder::new()
            .prefix("trivy.sbom.")
            .suffix(".json")
            .tempfile_in(work_dir)
            .map_err(|source| HandlerError::io("failed to create temporary SBOM file", source))?;
        let report = tempfile::Builder::new()
            .prefix("trivy.report.")
            .suffix(".json")
            .tempfile_in(work_dir)
            .map_err(|source| HandlerError::io("failed to create temporary report file", source))?;
        let home = tempfile::Builder::new()
            .prefix("trivy-")
            .tempdir_in(work_dir)
            .map_err(|source| HandlerError::io("failed to create temporary scanner home", source))?;
        Ok(Self { sbom, report, home })
    }

    fn invocation(&self, vex: bool) -> ScanInvocation {
        ScanInvocation {
            sbom_file: self.sbom.path().to_path_buf(),
            report_file: self.report.path().to_path_buf(),
            home_dir: self.home.path().to_path_buf(),
            vex,
        }
    }

    /// Removes everything, reporting failures that drop would swallow.
    fn close(self) {
        if let Err(e) = self.sbom.close() {
            warn!(error = %e, "Failed to remove temporary SBOM file");
        }
        if let Err(e) = self.report.close() {
            warn!(error = %e, "Failed to remove temporary report file");
        }
        if let Err(e) = self.home.close() {
            warn!(error = %e, "Failed to remove temporary scanner home");
        }
    }
}
