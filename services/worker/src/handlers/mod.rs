//! Task handlers.

mod scan_sbom;

pub use scan_sbom::{ScanOutcome, ScanSbomHandler};

use async_trait::async_trait;

use crate::error::HandlerError;

/// Processes the payloads published on one subject.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    fn subject(&self) -> &str;

    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}
