//! Startup objects for a standalone dev-mode worker.
//!
//! ```yaml
//! vexHubs: [ <VexHub> ]
//! scanJobs: [ <ScanJob> ]
//! sboms: [ <Sbom labelled scanjob=<job name>> ]
//! ```
//!
//! Every SBOM labelled with a seeded job becomes one scan task.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use vscan_api::{
    ObjectKey, Resource, Sbom, ScanJob, ScanSbomMessage, VexHub, LABEL_SCAN_JOB,
    LABEL_SCAN_JOB_UID,
};
use vscan_store::Client;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub vex_hubs: Vec<VexHub>,
    #[serde(default)]
    pub scan_jobs: Vec<ScanJob>,
    #[serde(default)]
    pub sboms: Vec<Sbom>,
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("invalid seed file {}", path.display()))
    }

    /// Create the seeded objects and return the scan tasks they imply.
    ///
    /// SBOMs get the `scanjob-uid` label of the job they name, since job
    /// uids are only known once the job is stored.
    pub async fn apply(self, client: &Client) -> Result<Vec<ScanSbomMessage>> {
        for hub in &self.vex_hubs {
            client.create(hub).await.context("failed to seed VEXHub")?;
        }

        let mut job_uids = HashMap::new();
        for job in &self.scan_jobs {
            let created = client.create(job).await.context("failed to seed ScanJob")?;
            if let Some(uid) = created.metadata.uid {
                job_uids.insert(created.key(), uid.to_string());
            }
        }

        let mut tasks = Vec::new();
        for mut sbom in self.sboms {
            let job_name = sbom.metadata.label(LABEL_SCAN_JOB).map(str::to_string);
            if let Some(job_name) = &job_name {
                let job_key = ObjectKey::new(&sbom.metadata.namespace, job_name);
                match job_uids.get(&job_key) {
                    Some(uid) => {
                        sbom.metadata
                            .labels
                            .insert(LABEL_SCAN_JOB_UID.to_string(), uid.clone());
                    }
                    None => warn!(sbom = %sbom.key(), scan_job = %job_key, "SBOM names an unknown ScanJob"),
                }
            }
            let created = client.create(&sbom).await.context("failed to seed SBOM")?;
            if let Some(job_name) = job_name {
                tasks.push(ScanSbomMessage::new(
                    job_name,
                    &created.metadata.name,
                    &created.metadata.namespace,
                ));
            }
        }

        info!(
            vex_hubs = self.vex_hubs.len(),
            scan_jobs = self.scan_jobs.len(),
            tasks = tasks.len(),
            "Seeded embedded store"
        );
        Ok(tasks)
    }
}
