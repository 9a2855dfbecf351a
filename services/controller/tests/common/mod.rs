//! In-process pipeline for controller tests: memory store and bus, static
//! catalog, the manager and a worker pool with a stub scanner.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vscan_api::{
    ImageMetadata, LabelSelector, ObjectKey, ObjectMeta, Registry, RegistrySpec, ScanJob,
    ScanJobSpec,
};
use vscan_controller::{DiscoveredImage, Manager, ManagerConfig, StaticCatalog};
use vscan_messaging::{MemoryBus, MemoryBusConfig, PublisherConfig, TaskPublisher};
use vscan_reconcile::BackoffPolicy;
use vscan_store::{Client, MemoryStore};
use vscan_worker::{ScanInvocation, ScanSbomHandler, Scanner, ScannerError, WorkerPool, WorkerPoolConfig};

pub const NAMESPACE: &str = "default";
pub const REGISTRY: &str = "test-registry";

/// Scanner stub. SBOMs whose document carries `"unscannable": true` fail.
pub struct StubScanner;

#[async_trait]
impl Scanner for StubScanner {
    async fn scan(&self, invocation: &ScanInvocation) -> Result<(), ScannerError> {
        let spdx: Value = serde_json::from_slice(&tokio::fs::read(&invocation.sbom_file).await?)
            .map_err(std::io::Error::other)?;
        if spdx["unscannable"] == json!(true) {
            return Err(ScannerError::Io(std::io::Error::other("unsupported SBOM")));
        }
        let report = json!({ "version": "2.1.0", "runs": [{ "results": [] }] });
        tokio::fs::write(&invocation.report_file, report.to_string()).await?;
        Ok(())
    }
}

pub fn image(repository: &str, platform: &str) -> DiscoveredImage {
    DiscoveredImage {
        metadata: ImageMetadata {
            registry: REGISTRY.into(),
            registry_uri: "ghcr.io".into(),
            repository: repository.into(),
            tag: "latest".into(),
            platform: platform.into(),
            digest: format!("sha256:{}", platform.replace('/', "")),
        },
        spdx: json!({ "spdxVersion": "SPDX-2.3", "name": format!("{repository} {platform}") }),
    }
}

pub fn unscannable(repository: &str, platform: &str) -> DiscoveredImage {
    let mut image = image(repository, platform);
    image.spdx["unscannable"] = json!(true);
    image
}

pub struct Pipeline {
    pub client: Client,
    pub bus: MemoryBus,
    pub catalog: Arc<StaticCatalog>,
    pub publisher: TaskPublisher,
    shutdown: watch::Sender<bool>,
    manager: JoinHandle<()>,
    pool: JoinHandle<()>,
    _work_dir: tempfile::TempDir,
}

/// Small intervals so budgets run out within a test.
pub fn fast_config() -> ManagerConfig {
    let mut config = ManagerConfig {
        workers: 2,
        resync_interval: Duration::from_secs(1),
        backoff: BackoffPolicy::fixed(Duration::from_millis(20), Duration::from_millis(100)),
        drain_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    config.job.max_task_attempts = 2;
    config.job.task_redispatch_interval = Duration::from_millis(500);
    config.job.catalog_retries = 2;
    config
}

impl Pipeline {
    pub async fn start(config: ManagerConfig) -> Self {
        Self::start_with_publisher(config, PublisherConfig::default()).await
    }

    pub async fn start_with_publisher(config: ManagerConfig, publisher: PublisherConfig) -> Self {
        let client = Client::new(Arc::new(MemoryStore::new()));
        let bus = MemoryBus::new(MemoryBusConfig {
            max_deliver: 2,
            redelivery_delay: Duration::from_millis(20),
        });
        let catalog = Arc::new(StaticCatalog::new());
        let work_dir = tempfile::tempdir().unwrap();

        let registry = Registry {
            metadata: ObjectMeta::new(NAMESPACE, REGISTRY),
            spec: RegistrySpec {
                uri: "ghcr.io".into(),
                ..Default::default()
            },
        };
        client.create(&registry).await.unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);

        let publisher = TaskPublisher::new(Arc::new(bus.clone()), publisher);
        let manager = Manager::new(client.clone(), publisher.clone(), catalog.clone(), config);
        let manager = tokio::spawn({
            let rx = shutdown_rx.clone();
            async move { manager.run(rx).await.unwrap() }
        });

        let handler = Arc::new(ScanSbomHandler::new(
            client.clone(),
            Arc::new(StubScanner),
            work_dir.path(),
        ));
        let pool = WorkerPool::new(
            Arc::new(bus.clone()),
            handler,
            WorkerPoolConfig { concurrency: 2 },
        );
        let pool = tokio::spawn(async move { pool.run(shutdown_rx).await.unwrap() });

        Self {
            client,
            bus,
            catalog,
            publisher,
            shutdown,
            manager,
            pool,
            _work_dir: work_dir,
        }
    }

    pub fn registry_key(&self) -> ObjectKey {
        ObjectKey::new(NAMESPACE, REGISTRY)
    }

    pub async fn create_job(&self, name: &str, registry: &str) -> ScanJob {
        let job = ScanJob {
            metadata: ObjectMeta::new(NAMESPACE, name),
            spec: ScanJobSpec {
                registry: registry.into(),
            },
            ..Default::default()
        };
        self.client.create(&job).await.unwrap()
    }

    /// Polls the job until `done` holds, panicking after ten seconds.
    pub async fn wait_for_job<F>(&self, name: &str, done: F) -> ScanJob
    where
        F: Fn(&ScanJob) -> bool,
    {
        let key = ObjectKey::new(NAMESPACE, name);
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let job: ScanJob = self.client.get(&key).await.unwrap();
                if done(&job) {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        match result {
            Ok(job) => job,
            Err(_) => {
                let job: ScanJob = self.client.get(&key).await.unwrap();
                panic!("timed out waiting for ScanJob {name}: {:?}", job.status);
            }
        }
    }

    pub async fn list<R: vscan_api::Resource>(&self, selector: &LabelSelector) -> Vec<R> {
        self.client.list(Some(NAMESPACE), selector).await.unwrap()
    }

    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(10), self.manager)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), self.pool)
            .await
            .unwrap()
            .unwrap();
    }
}
