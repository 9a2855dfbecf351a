use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use vscan_messaging::BusConfig;

use crate::manager::ManagerConfig;
use crate::scanjob::JobReconcilerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub bus: BusConfig,
    /// `0` disables the metrics endpoint.
    pub metrics_addr: String,
    pub health_addr: String,
    pub leader_elect: bool,
    pub resync_interval: Duration,
    pub concurrency: usize,
    pub max_task_attempts: u32,
    pub task_redispatch_interval: Duration,
    pub fail_on_empty_registry: bool,
    /// Run store, bus and a worker pool inside this process.
    pub dev_mode: bool,
    /// Objects loaded into the embedded store at startup.
    pub seed_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("VSCAN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let metrics_addr = std::env::var("VSCAN_METRICS_ADDR").unwrap_or_else(|_| "0".to_string());
        let health_addr = std::env::var("VSCAN_HEALTH_ADDR").unwrap_or_else(|_| ":8081".to_string());

        Ok(Self {
            log_level,
            bus: BusConfig::from_env(),
            metrics_addr,
            health_addr,
            leader_elect: env_flag("VSCAN_LEADER_ELECT"),
            resync_interval: env_secs("VSCAN_RESYNC_INTERVAL", 30)?,
            concurrency: env_parse("VSCAN_CONCURRENCY", 2)?,
            max_task_attempts: env_parse("VSCAN_MAX_TASK_ATTEMPTS", 3)?,
            task_redispatch_interval: env_secs("VSCAN_TASK_REDISPATCH_INTERVAL", 600)?,
            fail_on_empty_registry: env_flag("VSCAN_FAIL_ON_EMPTY_REGISTRY"),
            dev_mode: env_flag("VSCAN_DEV"),
            seed_file: std::env::var("VSCAN_SEED_FILE").ok().map(PathBuf::from),
        })
    }

    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            workers: self.concurrency.max(1),
            resync_interval: self.resync_interval,
            job: JobReconcilerConfig {
                max_task_attempts: self.max_task_attempts.max(1),
                task_redispatch_interval: self.task_redispatch_interval,
                fail_on_empty_registry: self.fail_on_empty_registry,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => v.parse().with_context(|| format!("invalid {name}: {v:?}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    env_parse(name, default).map(Duration::from_secs)
}
