//! End-to-end happy path test.
//!
//! Runs the whole pipeline in one process against a stand-in scanner
//! executable, verifying:
//!
//! 1. A single scan task for `test-artifact` yields its report
//! 2. A ScanJob fans out over a registry and reaches `Succeeded`
//! 3. Enabled VEX hubs reach the scanner invocation
//! 4. No scratch files outlive a scan
//!
//! ## Running
//!
//! ```bash
//! cargo test -p vscan-e2e --test happy_path
//! ```

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use vscan_api::{
    condition_reasons as reasons, condition_types as types, ImageMetadata, LabelSelector,
    ObjectKey, ObjectMeta, Registry, RegistrySpec, ResourceKind, Sbom, ScanJob, ScanJobPhase,
    ScanJobSpec, ScanSbomMessage, VexHub, VexHubSpec, VulnerabilityReport, LABEL_SCAN_JOB,
    LABEL_SCAN_JOB_UID,
};
use vscan_controller::{DiscoveredImage, Manager, ManagerConfig, StaticCatalog};
use vscan_messaging::{MemoryBus, MemoryBusConfig, PublisherConfig, TaskPublisher};
use vscan_reconcile::BackoffPolicy;
use vscan_store::{Client, MemoryStore};
use vscan_worker::{
    ScanSbomHandler, ScannerConfig, TrivyScanner, WorkerPool, WorkerPoolConfig,
};

const NAMESPACE: &str = "default";

/// Stand-in scanner: writes a SARIF log naming its input and recording
/// whether VEX enrichment was requested with a descriptor in place.
const SCANNER_SCRIPT: &str = r#"#!/bin/sh
out=""
vex=false
while [ $# -gt 1 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    --vex) vex=true; shift 2 ;;
    *) shift ;;
  esac
done
if [ "$vex" = true ] && [ ! -f "$XDG_DATA_HOME/.trivy/vex/repository.yaml" ]; then
  echo "vex requested without repository.yaml" >&2
  exit 1
fi
printf '{"version":"2.1.0","runs":[{"tool":{"driver":{"name":"Trivy"}},"results":[],"originalUriBaseIds":{"ROOTPATH":{"uri":"file://%s"}},"properties":{"vex":%s}}]}\n' \
  "$1" "$vex" > "$out"
"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vscan_controller=debug,vscan_worker=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn install_scanner(dir: &Path) -> PathBuf {
    let path = dir.join("trivy");
    std::fs::write(&path, SCANNER_SCRIPT).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn image(platform: &str) -> ImageMetadata {
    ImageMetadata {
        registry: "test-registry".into(),
        registry_uri: "registry-1.docker.io".into(),
        repository: "library/golang".into(),
        tag: "1.12-alpine".into(),
        platform: platform.into(),
        digest: format!("sha256:{}", platform.replace('/', "")),
    }
}

fn spdx(platform: &str) -> Value {
    json!({
        "spdxVersion": "SPDX-2.3",
        "name": format!("library/golang:1.12-alpine {platform}"),
        "packages": [
            { "name": "musl", "versionInfo": "1.1.20-r4" },
            { "name": "busybox", "versionInfo": "1.29.3-r10" }
        ]
    })
}

/// Worker side of the pipeline: scratch directories, the scanner script and
/// a pool consuming from `bus`.
struct Worker {
    root: tempfile::TempDir,
    shutdown: watch::Sender<bool>,
    pool: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn start(client: &Client, bus: &MemoryBus) -> Self {
        let root = tempfile::tempdir().unwrap();
        let work_dir = root.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();

        let scanner = TrivyScanner::new(ScannerConfig {
            path: install_scanner(root.path()),
            cache_dir: root.path().join("cache"),
            timeout: Duration::from_secs(30),
            ..Default::default()
        });
        let handler = ScanSbomHandler::new(client.clone(), Arc::new(scanner), work_dir);
        let pool = WorkerPool::new(
            Arc::new(bus.clone()),
            Arc::new(handler),
            WorkerPoolConfig { concurrency: 2 },
        );

        let (shutdown, rx) = watch::channel(false);
        let pool = tokio::spawn(async move { pool.run(rx).await.unwrap() });
        Self {
            root,
            shutdown,
            pool,
        }
    }

    fn leftovers(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.root.path().join("work"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(10), self.pool)
            .await
            .unwrap()
            .unwrap();
    }
}

async fn wait_until_idle(bus: &MemoryBus) {
    tokio::time::timeout(Duration::from_secs(15), async {
        while !bus.is_idle() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("bus did not settle");
}

#[tokio::test]
async fn e2e_scan_task_produces_owned_report() {
    init_tracing();
    let client = Client::new(Arc::new(MemoryStore::new()));
    let bus = MemoryBus::new(MemoryBusConfig::default());

    let job = client
        .create(&ScanJob {
            metadata: ObjectMeta::new(NAMESPACE, "test-job"),
            spec: ScanJobSpec {
                registry: "test-registry".into(),
            },
            ..Default::default()
        })
        .await
        .unwrap();

    let mut metadata = ObjectMeta::new(NAMESPACE, "test-artifact");
    metadata.labels.insert(LABEL_SCAN_JOB.into(), "test-job".into());
    metadata.labels.insert(
        LABEL_SCAN_JOB_UID.into(),
        job.metadata.uid.unwrap().to_string(),
    );
    let sbom = client
        .create(&Sbom {
            metadata,
            image_metadata: image("linux/amd64"),
            spdx: spdx("linux/amd64"),
        })
        .await
        .unwrap();

    let worker = Worker::start(&client, &bus);
    let publisher = TaskPublisher::new(Arc::new(bus.clone()), PublisherConfig::default());
    publisher
        .publish_scan(&ScanSbomMessage::new("test-job", "test-artifact", NAMESPACE))
        .await
        .unwrap();
    assert!(publisher.drain(Duration::from_secs(5)).await);

    wait_until_idle(&bus).await;
    assert_eq!(bus.stats().acked, 1);

    let report: VulnerabilityReport = client
        .get(&ObjectKey::new(NAMESPACE, "test-artifact"))
        .await
        .unwrap();
    assert_eq!(report.metadata.label(LABEL_SCAN_JOB), Some("test-job"));
    let owner = report.metadata.controller_ref().unwrap();
    assert_eq!(owner.kind, ResourceKind::Sbom);
    assert_eq!(Some(owner.uid), sbom.metadata.uid);
    assert_eq!(report.image_metadata, sbom.image_metadata);
    assert_eq!(report.report["runs"][0]["properties"]["vex"], false);
    assert!(worker.leftovers().is_empty());

    worker.stop().await;
}

#[tokio::test]
async fn e2e_scan_job_runs_to_completion() {
    init_tracing();
    let client = Client::new(Arc::new(MemoryStore::new()));
    let bus = MemoryBus::new(MemoryBusConfig {
        max_deliver: 3,
        redelivery_delay: Duration::from_millis(20),
    });
    let catalog = Arc::new(StaticCatalog::new());

    client
        .create(&Registry {
            metadata: ObjectMeta::new(NAMESPACE, "test-registry"),
            spec: RegistrySpec {
                uri: "registry-1.docker.io".into(),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    client
        .create(&VexHub {
            metadata: ObjectMeta::new("", "vexhub"),
            spec: VexHubSpec {
                url: "https://github.com/aquasecurity/vexhub".into(),
                enabled: true,
            },
        })
        .await
        .unwrap();

    let platforms = ["linux/amd64", "linux/arm64/v8", "linux/s390x"];
    catalog.set_images(
        ObjectKey::new(NAMESPACE, "test-registry"),
        platforms
            .iter()
            .map(|p| DiscoveredImage {
                metadata: image(p),
                spdx: spdx(p),
            })
            .collect(),
    );

    let worker = Worker::start(&client, &bus);

    let config = ManagerConfig {
        resync_interval: Duration::from_secs(1),
        backoff: BackoffPolicy::fixed(Duration::from_millis(20), Duration::from_millis(200)),
        drain_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let publisher = TaskPublisher::new(Arc::new(bus.clone()), PublisherConfig::default());
    let manager = Manager::new(client.clone(), publisher, catalog, config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = tokio::spawn(manager.run(shutdown_rx));

    let created = client
        .create(&ScanJob {
            metadata: ObjectMeta::new(NAMESPACE, "nightly"),
            spec: ScanJobSpec {
                registry: "test-registry".into(),
            },
            ..Default::default()
        })
        .await
        .unwrap();

    let key = ObjectKey::new(NAMESPACE, "nightly");
    let job: ScanJob = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let job: ScanJob = client.get(&key).await.unwrap();
            if job.status.phase.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("ScanJob did not finish");

    assert_eq!(job.status.phase, ScanJobPhase::Succeeded);
    assert_eq!(job.status.images_count, platforms.len() as u32);
    assert_eq!(job.status.scanned_images_count, platforms.len() as u32);
    assert_eq!(
        job.status.condition(types::COMPLETE).unwrap().reason,
        reasons::ALL_SCANNED
    );

    let selector = LabelSelector::new().with_label(LABEL_SCAN_JOB, "nightly");
    let sboms: Vec<Sbom> = client.list(Some(NAMESPACE), &selector).await.unwrap();
    let reports: Vec<VulnerabilityReport> = client.list(Some(NAMESPACE), &selector).await.unwrap();
    assert_eq!(sboms.len(), platforms.len());
    assert_eq!(reports.len(), platforms.len());

    let uid = created.metadata.uid.unwrap();
    for report in &reports {
        let sbom = sboms
            .iter()
            .find(|s| s.metadata.name == report.metadata.name)
            .expect("report without SBOM");
        assert!(report.metadata.is_owned_by(&sbom.metadata.uid.unwrap()));
        assert_eq!(
            report.metadata.label(LABEL_SCAN_JOB_UID),
            Some(uid.to_string().as_str())
        );
        assert_eq!(report.report["runs"][0]["properties"]["vex"], true);
    }

    wait_until_idle(&bus).await;
    assert_eq!(bus.stats().published, platforms.len() as u64);
    assert_eq!(bus.stats().dead_lettered, 0);
    assert!(worker.leftovers().is_empty());

    shutdown_tx.send_replace(true);
    tokio::time::timeout(Duration::from_secs(10), manager)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    worker.stop().await;
}
