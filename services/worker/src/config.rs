use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use vscan_messaging::BusConfig;

use crate::consumer::WorkerPoolConfig;
use crate::scanner::{ScannerConfig, DEFAULT_DB_REPOSITORY, DEFAULT_JAVA_DB_REPOSITORY};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub bus: BusConfig,
    /// Parent of every per-task workspace.
    pub work_dir: PathBuf,
    /// Scanner database cache.
    pub cache_dir: PathBuf,
    pub scanner_path: PathBuf,
    pub db_repository: String,
    pub java_db_repository: String,
    pub scan_timeout: Duration,
    pub concurrency: usize,
    /// Run against an embedded store and bus.
    pub dev_mode: bool,
    /// Objects and tasks loaded at startup in dev mode.
    pub seed_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let work_dir = std::env::var("VSCAN_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("vscan"));
        let cache_dir = std::env::var("VSCAN_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("cache"));

        let concurrency = match std::env::var("VSCAN_CONCURRENCY") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("invalid VSCAN_CONCURRENCY: {v:?}"))?,
            Err(_) => 2,
        };
        let scan_timeout = match std::env::var("VSCAN_SCAN_TIMEOUT") {
            Ok(v) => Duration::from_secs(
                v.parse()
                    .with_context(|| format!("invalid VSCAN_SCAN_TIMEOUT: {v:?}"))?,
            ),
            Err(_) => ScannerConfig::default().timeout,
        };

        Ok(Self {
            log_level: std::env::var("VSCAN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            bus: BusConfig::from_env(),
            work_dir,
            cache_dir,
            scanner_path: std::env::var("VSCAN_SCANNER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("trivy")),
            db_repository: std::env::var("VSCAN_DB_REPOSITORY")
                .unwrap_or_else(|_| DEFAULT_DB_REPOSITORY.to_string()),
            java_db_repository: std::env::var("VSCAN_JAVA_DB_REPOSITORY")
                .unwrap_or_else(|_| DEFAULT_JAVA_DB_REPOSITORY.to_string()),
            scan_timeout,
            concurrency,
            dev_mode: std::env::var("VSCAN_DEV")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
            seed_file: std::env::var("VSCAN_SEED_FILE").ok().map(PathBuf::from),
        })
    }

    pub fn scanner(&self) -> ScannerConfig {
        ScannerConfig {
            path: self.scanner_path.clone(),
            cache_dir: self.cache_dir.clone(),
            db_repository: self.db_repository.clone(),
            java_db_repository: self.java_db_repository.clone(),
            timeout: self.scan_timeout,
        }
    }

    pub fn pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.concurrency.max(1),
        }
    }

    /// Creates the work and cache directories.
    pub fn prepare_dirs(&self) -> Result<()> {
        for dir in [&self.work_dir, &self.cache_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
