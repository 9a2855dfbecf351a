//! Controller error types.

use thiserror::Error;
use vscan_api::ApiError;
use vscan_messaging::PublishError;
use vscan_reconcile::ReconcileError;
use vscan_store::StoreError;

use crate::catalog::CatalogError;

/// Errors returned by the reconcilers.
///
/// Every variant is retried by the controller runner with backoff; domain
/// failures that should end a ScanJob are written to its status instead of
/// being returned.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Api(#[from] ApiError),

    /// The correlation index has not caught up with objects just written.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
