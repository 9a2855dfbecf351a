//! VEX repository descriptor.
//!
//! trivy reads its VEX repositories from
//! `$XDG_DATA_HOME/.trivy/vex/repository.yaml`. The descriptor is written
//! fresh into each invocation's private home, so toggling a hub takes
//! effect on the next scan.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vscan_api::VexHub;

use crate::error::HandlerError;

/// Directory holding VEX repositories, relative to the scanner home.
pub const VEX_SUBDIR: &str = ".trivy/vex";

/// Repository descriptor file name.
pub const VEX_REPOSITORY_FILE: &str = "repository.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VexRepositoryConfig {
    pub repositories: Vec<VexRepository>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VexRepository {
    pub name: String,
    pub url: String,
    pub enabled: bool,
}

impl From<&VexHub> for VexRepository {
    fn from(hub: &VexHub) -> Self {
        Self {
            name: hub.metadata.name.clone(),
            url: hub.spec.url.clone(),
            enabled: hub.spec.enabled,
        }
    }
}

impl VexRepositoryConfig {
    pub fn from_hubs(hubs: &[VexHub]) -> Self {
        Self {
            repositories: hubs.iter().map(VexRepository::from).collect(),
        }
    }
}

/// Whether any hub asks for enrichment.
pub fn enrichment_enabled(hubs: &[VexHub]) -> bool {
    hubs.iter().any(|hub| hub.spec.enabled)
}

pub fn descriptor_path(home: &Path) -> PathBuf {
    home.join(VEX_SUBDIR).join(VEX_REPOSITORY_FILE)
}

/// Writes the descriptor listing every hub into `home`.
pub async fn write_descriptor(home: &Path, hubs: &[VexHub]) -> Result<PathBuf, HandlerError> {
    let yaml = serde_yaml::to_string(&VexRepositoryConfig::from_hubs(hubs))?;
    let dir = home.join(VEX_SUBDIR);
    let path = dir.join(VEX_REPOSITORY_FILE);

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| HandlerError::io("failed to create VEX directory", source))?;
    tokio::fs::write(&path, yaml)
        .await
        .map_err(|source| HandlerError::io("failed to write VEX repository file", source))?;
    restrict_permissions(&dir, &path).await?;

    Ok(path)
}

#[cfg(unix)]
async fn restrict_permissions(dir: &Path, file: &Path) -> Result<(), HandlerError> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(dir, Permissions::from_mode(0o750))
        .await
        .map_err(|source| HandlerError::io("failed to restrict VEX directory", source))?;
    tokio::fs::set_permissions(file, Permissions::from_mode(0o600))
        .await
        .map_err(|source| HandlerError::io("failed to restrict VEX repository file", source))
}

#[cfg(not(unix))]
async fn restrict_permissions(_dir: &Path, _file: &Path) -> Result<(), HandlerError> {
    Ok(())
}
