//! Startup objects for the embedded store.
//!
//! The seed file is YAML:
//!
//! ```yaml
//! registries: [ <Registry> ]
//! vexHubs: [ <VexHub> ]
//! scanJobs: [ <ScanJob> ]
//! catalog:
//!   - registry: { namespace: default, name: ghcr }
//!     images: [ { metadata: <ImageMetadata>, spdx: <SPDX document> } ]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;
use vscan_api::{ObjectKey, Registry, ScanJob, VexHub};
use vscan_store::Client;

use crate::catalog::{DiscoveredImage, StaticCatalog};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub registries: Vec<Registry>,
    #[serde(default)]
    pub vex_hubs: Vec<VexHub>,
    #[serde(default)]
    pub scan_jobs: Vec<ScanJob>,
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
pub struct CatalogEntry {
    pub registry: ObjectKey,
    #[serde(default)]
    pub images: Vec<DiscoveredImage>,
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("invalid seed file {}", path.display()))
    }

    /// Create the seeded objects and fill the catalog.
    ///
    /// Jobs go last so their first reconcile sees registries and hubs.
    pub async fn apply(self, client: &Client, catalog: &StaticCatalog) -> Result<()> {
        for entry in self.catalog {
            catalog.set_images(entry.registry, entry.images);
        }
        for registry in &self.registries {
            client.create(registry).await.context("failed to seed Registry")?;
        }
        for hub in &self.vex_hubs {
            client.create(hub).await.context("failed to seed VEXHub")?;
        }
        for job in &self.scan_jobs {
            client.create(job).await.context("failed to seed ScanJob")?;
        }
        info!(
            registries = self.registries.len(),
            vex_hubs = self.vex_hubs.len(),
            scan_jobs = self.scan_jobs.len(),
            "Seeded embedded store"
        );
        Ok(())
    }
}
