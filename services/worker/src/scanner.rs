//! External vulnerability scanner.
//!
//! The scanner is a subprocess (trivy) that reads an SPDX document and
//! writes a SARIF report. Every invocation gets its own home directory so
//! the optional VEX repository descriptor never leaks between tasks.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Default vulnerability database repository.
pub const DEFAULT_DB_REPOSITORY: &str = "public.ecr.aws/aquasecurity/trivy-db";

/// Default Java vulnerability database repository.
pub const DEFAULT_JAVA_DB_REPOSITORY: &str = "public.ecr.aws/aquasecurity/trivy-java-db";

/// Longest stderr excerpt carried in a [`ScannerError::Failed`].
const STDERR_EXCERPT: usize = 4096;

/// Scanner settings.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Path to the scanner binary.
    pub path: PathBuf,
    /// Vulnerability database cache, shared across invocations.
    pub cache_dir: PathBuf,
    pub db_repository: String,
    pub java_db_repository: String,
    /// Upper bound on a single run.
    pub timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("trivy"),
            cache_dir: PathBuf::from("/var/cache/vscan/trivy"),
            db_repository: DEFAULT_DB_REPOSITORY.to_string(),
            java_db_repository: DEFAULT_JAVA_DB_REPOSITORY.to_string(),
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Paths and flags for a single scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanInvocation {
    /// SPDX input.
    pub sbom_file: PathBuf,
    /// SARIF output.
    pub report_file: PathBuf,
    /// Private home directory, exported as `XDG_DATA_HOME`.
    pub home_dir: PathBuf,
    /// Enable VEX enrichment from the repository descriptor under `home_dir`.
    pub vex: bool,
}

impl ScanInvocation {
    /// Command-line arguments for the scanner.
    pub fn args(&self, config: &ScannerConfig) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "sbom".into(),
            "--skip-version-check".into(),
            "--disable-telemetry".into(),
            "--cache-dir".into(),
            config.cache_dir.clone().into(),
            "--format".into(),
            "sarif".into(),
            "--db-repository".into(),
            config.db_repository.clone().into(),
            "--java-db-repository".into(),
            config.java_db_repository.clone().into(),
            "--output".into(),
            self.report_file.clone().into(),
        ];
        if self.vex {
            args.extend(["--vex".into(), "repo".into(), "--show-suppressed".into()]);
        }
        args.push(self.sbom_file.clone().into());
        args
    }
}

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("failed to start scanner {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("scanner exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },

    #[error("scanner timed out after {0:?}")]
    Timeout(Duration),

    #[error("scanner I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Runs one scan to completion.
///
/// Dropping the returned future must stop the scan.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, invocation: &ScanInvocation) -> Result<(), ScannerError>;
}

/// Scanner backed by the trivy binary.
pub struct TrivyScanner {
    config: ScannerConfig,
}

impl TrivyScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }
}

#[async_trait]
impl Scanner for TrivyScanner {
    async fn scan(&self, invocation: &ScanInvocation) -> Result<(), ScannerError> {
        let args = invocation.args(&self.config);
        debug!(
            scanner = %self.config.path.display(),
            sbom = %invocation.sbom_file.display(),
            vex = invocation.vex,
            "Starting scanner"
        );

        let child = Command::new(&self.config.path)
            .args(&args)
            .env("XDG_DATA_HOME", &invocation.home_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ScannerError::Spawn {
                path: self.config.path.clone(),
                source,
            })?;

        // On timeout the child is dropped, which kills it.
        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| ScannerError::Timeout(self.config.timeout))??;

        if !output.status.success() {
            return Err(ScannerError::Failed {
                status: output.status,
                stderr: stderr_excerpt(&output.stderr),
            });
        }
        Ok(())
    }
}

/// Tail of the scanner's stderr, where the actual error usually is.
fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_EXCERPT {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_EXCERPT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
