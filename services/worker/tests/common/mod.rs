//! Shared test fixtures for the scan handler tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use vscan_api::{
    ImageMetadata, ObjectMeta, Sbom, ScanJob, ScanJobSpec, VexHub, VexHubSpec, LABEL_SCAN_JOB,
    LABEL_SCAN_JOB_UID,
};
use vscan_store::{Client, MemoryStore};
use vscan_worker::{vex, ScanInvocation, Scanner, ScannerError};

pub const NAMESPACE: &str = "default";
pub const JOB: &str = "test-job";
pub const SBOM: &str = "test-artifact";

/// Advisories known to [`RecordingScanner`]: package, affected version,
/// id and SARIF level.
const ADVISORIES: &[(&str, &str, &str, &str)] = &[
    ("musl", "1.1.20-r4", "CVE-2019-14697", "error"),
    ("busybox", "1.29.3-r10", "CVE-2019-5747", "warning"),
    ("openssl", "1.1.1b-r1", "CVE-2019-1543", "warning"),
];

/// What the scanner saw during one run.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub invocation: ScanInvocation,
    pub spdx: Value,
    /// Contents of the VEX descriptor, if one was present.
    pub vex_descriptor: Option<vex::VexRepositoryConfig>,
}

/// Scanner double that derives a SARIF report from the SPDX input.
#[derive(Default)]
pub struct RecordingScanner {
    runs: Mutex<Vec<Recorded>>,
    fail: AtomicBool,
    garbage: AtomicBool,
}

impl RecordingScanner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Write a report that is not JSON.
    pub fn garbage(&self, garbage: bool) {
        self.garbage.store(garbage, Ordering::SeqCst);
    }

    pub fn runs(&self) -> Vec<Recorded> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scanner for RecordingScanner {
    async fn scan(&self, invocation: &ScanInvocation) -> Result<(), ScannerError> {
        let spdx: Value = serde_json::from_slice(&tokio::fs::read(&invocation.sbom_file).await?)
            .map_err(std::io::Error::other)?;
        let descriptor_path = vex::descriptor_path(&invocation.home_dir);
        let descriptor: Option<vex::VexRepositoryConfig> =
            match tokio::fs::read_to_string(&descriptor_path).await {
                Ok(raw) => Some(serde_yaml::from_str(&raw).map_err(std::io::Error::other)?),
                Err(_) => None,
            };
        self.runs.lock().unwrap().push(Recorded {
            invocation: invocation.clone(),
            spdx: spdx.clone(),
            vex_descriptor: descriptor,
        });

        if self.fail.load(Ordering::SeqCst) {
            return Err(ScannerError::Io(std::io::Error::other("scanner crashed")));
        }
        if self.garbage.load(Ordering::SeqCst) {
            tokio::fs::write(&invocation.report_file, b"FATAL: not a report").await?;
            return Ok(());
        }

        let target = invocation.sbom_file.display().to_string();
        let report = serde_json::to_vec(&sarif(&spdx, &target)).map_err(std::io::Error::other)?;
        tokio::fs::write(&invocation.report_file, report).await?;
        Ok(())
    }
}

/// SARIF report for the packages of an SPDX document.
pub fn sarif(spdx: &Value, target: &str) -> Value {
    let mut rules = Vec::new();
    let mut results = Vec::new();
    for package in spdx["packages"].as_array().into_iter().flatten() {
        let name = package["name"].as_str().unwrap_or_default();
        let version = package["versionInfo"].as_str().unwrap_or_default();
        for (affected, affected_version, id, level) in ADVISORIES {
            if *affected != name || *affected_version != version {
                continue;
            }
            rules.push(json!({
                "id": id,
                "shortDescription": { "text": format!("{name}: {id}") },
            }));
            results.push(json!({
                "ruleId": id,
                "level": level,
                "message": {
                    "text": format!("Package: {name}\nInstalled Version: {version}\nVulnerability {id}"),
                },
                "locations": [{
                    "physicalLocation": {
                        "artifactLocation": { "uri": format!("pkg:apk/alpine/{name}@{version}") },
                    },
                }],
            }));
        }
    }
    json!({
        "version": "2.1.0",
        "$schema": "https://json.schemastore.org/sarif-2.1.0.json",
        "runs": [{
            "tool": { "driver": { "name": "Trivy", "rules": rules } },
            "results": results,
            "properties": { "target": target },
        }],
    })
}

/// Replaces the scan target, which names a temporary file.
pub fn normalize_target(report: &mut Value) {
    if let Some(runs) = report["runs"].as_array_mut() {
        for run in runs {
            run["properties"]["target"] = json!("sbom.json");
        }
    }
}

pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture(name: &str) -> Value {
    let raw = std::fs::read(fixture_path(name)).unwrap();
    serde_json::from_slice(&raw).unwrap()
}

pub fn client() -> Client {
    Client::new(Arc::new(MemoryStore::new()))
}

pub fn image(platform: &str) -> ImageMetadata {
    ImageMetadata {
        registry: "test-registry".into(),
        registry_uri: "registry-1.docker.io".into(),
        repository: "library/golang".into(),
        tag: "1.12-alpine".into(),
        platform: platform.into(),
        digest: "sha256:1782cafde43390b032f960c0fad3def745fac18994ced169003cb56e9a93c028".into(),
    }
}

pub async fn create_job(client: &Client) -> ScanJob {
    let job = ScanJob {
        metadata: ObjectMeta::new(NAMESPACE, JOB),
        spec: ScanJobSpec {
            registry: "test-registry".into(),
        },
        ..Default::default()
    };
    client.create(&job).await.unwrap()
}

pub async fn create_sbom(client: &Client, job: &ScanJob, platform: &str, spdx: Value) -> Sbom {
    let mut metadata = ObjectMeta::new(NAMESPACE, SBOM);
    metadata.labels.insert(LABEL_SCAN_JOB.into(), JOB.into());
    metadata
        .labels
        .insert(LABEL_SCAN_JOB_UID.into(), job.metadata.uid.unwrap().to_string());
    let sbom = Sbom {
        metadata,
        image_metadata: image(platform),
        spdx,
    };
    client.create(&sbom).await.unwrap()
}

pub async fn create_hub(client: &Client, name: &str, enabled: bool) -> VexHub {
    let hub = VexHub {
        metadata: ObjectMeta::new("", name),
        spec: VexHubSpec {
            url: format!("https://{name}.example.com/vex"),
            enabled,
        },
    };
    client.create(&hub).await.unwrap()
}

/// Entries left in the work directory.
pub fn leftovers(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect()
}
