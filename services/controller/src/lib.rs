//! # vscan-controller
//!
//! Control loops driving ScanJobs to completion.
//!
//! ## Reconcilers
//!
//! - [`JobReconciler`] resolves a job's Registry, creates one SBOM per
//!   eligible image, publishes scan tasks and tracks progress until the
//!   job is terminal.
//! - [`ReportReconciler`] folds each arriving VulnerabilityReport into the
//!   status of the ScanJob named by its labels.
//!
//! Both are level-triggered: a watch event only names the job to look at,
//! and every reconcile recomputes status from what the store holds. The
//! [`CorrelationIndex`] maps jobs to their SBOMs and reports so that
//! recomputation does not list the store.
//!
//! ## Wiring
//!
//! [`Manager`] owns the store watch, routes events into the reconcilers'
//! work queues and drains the task publisher on shutdown.

pub mod catalog;
pub mod config;
pub mod error;
pub mod index;
pub mod manager;
pub mod report;
pub mod scanjob;
pub mod seed;
pub mod status;

pub use catalog::{CatalogError, DiscoveredImage, RegistryCatalog, StaticCatalog};
pub use config::Config;
pub use error::{ControllerError, ControllerResult};
pub use index::{CorrelationIndex, JobRef};
pub use manager::{Manager, ManagerConfig};
pub use report::ReportReconciler;
pub use scanjob::{sbom_name, JobReconciler, JobReconcilerConfig};
pub use status::{DispatchBudget, Progress};
