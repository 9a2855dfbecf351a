//! Resource definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kind::impl_resource;
use crate::{ObjectMeta, ResourceKind};

// =============================================================================
// Image metadata
// =============================================================================

/// Identity of a single platform-specific image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Name of the Registry record the image was discovered through.
    pub registry: String,
    pub registry_uri: String,
    pub repository: String,
    pub tag: String,
    /// e.g. `linux/amd64`, `linux/arm/v7`
    pub platform: String,
    pub digest: String,
}

impl ImageMetadata {
    /// `registry_uri/repository:tag@digest`
    pub fn reference(&self) -> String {
        format!(
            "{}/{}:{}@{}",
            self.registry_uri, self.repository, self.tag, self.digest
        )
    }
}

// =============================================================================
// Registry
// =============================================================================

/// A reachable image source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub metadata: ObjectMeta,
    pub spec: RegistrySpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    /// Registry address, e.g. `ghcr.io`.
    pub uri: String,

    /// Name of the secret holding pull credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<String>,

    /// Repositories to scan. Empty means every repository.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<String>,

    /// Platforms to scan. Empty means every platform.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
}

impl RegistrySpec {
    /// Whether an image discovered through this registry should be scanned.
    pub fn admits(&self, image: &ImageMetadata) -> bool {
        let repo_ok =
            self.repositories.is_empty() || self.repositories.iter().any(|r| r == &image.repository);
        let platform_ok =
            self.platforms.is_empty() || self.platforms.iter().any(|p| p == &image.platform);
        repo_ok && platform_ok
    }
}

impl_resource!(Registry, ResourceKind::Registry);

// =============================================================================
// ScanJob
// =============================================================================

/// One requested scan run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJob {
    pub metadata: ObjectMeta,
    pub spec: ScanJobSpec,
    #[serde(default)]
    pub status: ScanJobStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJobSpec {
    /// Name of the Registry (same namespace) to scan.
    pub registry: String,
}

impl_resource!(ScanJob, ResourceKind::ScanJob);

/// ScanJob lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanJobPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    PartialFailure,
}

impl ScanJobPhase {
    /// Terminal phases never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::PartialFailure)
    }
}

impl std::fmt::Display for ScanJobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::PartialFailure => "PartialFailure",
        };
        f.write_str(s)
    }
}

/// Condition types used on ScanJob status.
pub mod condition_types {
    pub const SCHEDULED: &str = "Scheduled";
    pub const IN_PROGRESS: &str = "InProgress";
    pub const COMPLETE: &str = "Complete";
    pub const FAILED: &str = "Failed";
}

/// Condition reasons used on ScanJob status.
pub mod condition_reasons {
    pub const PENDING: &str = "Pending";
    pub const DISPATCHED: &str = "TasksDispatched";
    pub const ALL_SCANNED: &str = "AllImagesScanned";
    pub const NO_IMAGES: &str = "NoImages";
    pub const REGISTRY_NOT_FOUND: &str = "RegistryNotFound";
    pub const REGISTRY_UNREACHABLE: &str = "RegistryUnreachable";
    pub const RETRIES_EXHAUSTED: &str = "RetriesExhausted";
    pub const NO_REPORTS: &str = "NoReports";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJobStatus {
    #[serde(default)]
    pub phase: ScanJobPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Number of SBOMs dispatched for this job.
    #[serde(default)]
    pub images_count: u32,

    /// Number of those SBOMs that have a report.
    #[serde(default)]
    pub scanned_images_count: u32,

    /// Dispatch rounds performed so far (initial dispatch included).
    #[serde(default)]
    pub dispatch_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dispatch_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl ScanJobStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Upserts a condition by type.
    ///
    /// The transition time only moves when the status value changes.
    pub fn set_condition(&mut self, mut condition: Condition, now: DateTime<Utc>) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status != condition.status {
                    existing.last_transition_time = Some(now);
                }
                existing.status = condition.status;
                existing.reason = condition.reason;
                existing.message = condition.message;
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition);
            }
        }
    }
}

// =============================================================================
// SBOM (artifact)
// =============================================================================

/// Per-image software inventory consumed by the scan handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sbom {
    pub metadata: ObjectMeta,
    pub image_metadata: ImageMetadata,
    /// Raw SPDX document.
    #[serde(default)]
    pub spdx: serde_json::Value,
}

impl_resource!(Sbom, ResourceKind::Sbom);

// =============================================================================
// VulnerabilityReport
// =============================================================================

/// Findings produced for exactly one SBOM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityReport {
    pub metadata: ObjectMeta,
    pub image_metadata: ImageMetadata,
    /// Raw scanner output (SARIF).
    #[serde(default)]
    pub report: serde_json::Value,
}

impl_resource!(VulnerabilityReport, ResourceKind::VulnerabilityReport);

// =============================================================================
// VEXHub
// =============================================================================

/// A cluster-wide VEX enrichment feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VexHub {
    pub metadata: ObjectMeta,
    pub spec: VexHubSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VexHubSpec {
    pub url: String,
    #[serde(default)]
    pub enabled: bool,
}

impl_resource!(VexHub, ResourceKind::VexHub);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn image(repo: &str, platform: &str) -> ImageMetadata {
        ImageMetadata {
            registry: "reg".into(),
            registry_uri: "ghcr.io".into(),
            repository: repo.into(),
            tag: "latest".into(),
            platform: platform.into(),
            digest: "sha256:abc".into(),
        }
    }

    #[test]
    fn test_registry_admits_everything_without_filters() {
        let spec = RegistrySpec::default();
        assert!(spec.admits(&image("library/golang", "linux/amd64")));
    }

    #[test]
    fn test_registry_filters() {
        let spec = RegistrySpec {
            uri: "ghcr.io".into(),
            auth_secret: None,
            repositories: vec!["library/golang".into()],
            platforms: vec!["linux/arm64".into()],
        };
        assert!(spec.admits(&image("library/golang", "linux/arm64")));
        assert!(!spec.admits(&image("library/golang", "linux/amd64")));
        assert!(!spec.admits(&image("library/alpine", "linux/arm64")));
    }

    #[test]
    fn test_phase_terminal() {
        assert!(!ScanJobPhase::Pending.is_terminal());
        assert!(!ScanJobPhase::Running.is_terminal());
        assert!(ScanJobPhase::Succeeded.is_terminal());
        assert!(ScanJobPhase::Failed.is_terminal());
        assert!(ScanJobPhase::PartialFailure.is_terminal());
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);
        let mut status = ScanJobStatus::default();

        status.set_condition(
            Condition::new(condition_types::IN_PROGRESS, ConditionStatus::True, "A", "first"),
            t0,
        );
        status.set_condition(
            Condition::new(condition_types::IN_PROGRESS, ConditionStatus::True, "B", "second"),
            t1,
        );

        let c = status.condition(condition_types::IN_PROGRESS).unwrap();
        assert_eq!(c.last_transition_time, Some(t0));
        assert_eq!(c.reason, "B");

        status.set_condition(
            Condition::new(condition_types::IN_PROGRESS, ConditionStatus::False, "C", "done"),
            t1,
        );
        let c = status.condition(condition_types::IN_PROGRESS).unwrap();
        assert_eq!(c.last_transition_time, Some(t1));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn test_scanjob_serialization_uses_camel_case() {
        let mut job = ScanJob::default();
        job.metadata = ObjectMeta::new("default", "job");
        job.status.images_count = 3;
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"]["imagesCount"], 3);
        assert_eq!(json["status"]["phase"], "Pending");
    }
}
