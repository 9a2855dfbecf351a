//! Task messages exchanged over the bus.

use serde::{Deserialize, Serialize};

use crate::{ApiError, ObjectKey};

/// Subject carrying SBOM scan tasks.
pub const SCAN_SBOM_SUBJECT: &str = "vscan.sbom.scan";

/// Request to scan one SBOM on behalf of one ScanJob.
///
/// The ScanJob lives in the SBOM's namespace. The message carries no
/// ordering token; duplicates and reordering are expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSbomMessage {
    pub scan_job_name: String,
    pub sbom_name: String,
    pub sbom_namespace: String,
}

impl ScanSbomMessage {
    pub fn new(
        scan_job_name: impl Into<String>,
        sbom_name: impl Into<String>,
        sbom_namespace: impl Into<String>,
    ) -> Self {
        Self {
            scan_job_name: scan_job_name.into(),
            sbom_name: sbom_name.into(),
            sbom_namespace: sbom_namespace.into(),
        }
    }

    /// Decodes and validates a payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ApiError> {
        let msg: Self = serde_json::from_slice(payload)
            .map_err(|e| ApiError::MalformedMessage(e.to_string()))?;

        if msg.scan_job_name.is_empty() {
            return Err(ApiError::MissingField("scanJobName"));
        }
        if msg.sbom_name.is_empty() {
            return Err(ApiError::MissingField("sbomName"));
        }
        if msg.sbom_namespace.is_empty() {
            return Err(ApiError::MissingField("sbomNamespace"));
        }

        Ok(msg)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ApiError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn sbom_key(&self) -> ObjectKey {
        ObjectKey::new(&self.sbom_namespace, &self.sbom_name)
    }

    pub fn scan_job_key(&self) -> ObjectKey {
        ObjectKey::new(&self.sbom_namespace, &self.scan_job_name)
    }
}
