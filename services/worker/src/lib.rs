//! # vscan-worker
//!
//! Consumes SBOM scan tasks from the bus, runs the external scanner over
//! each SBOM and stores the resulting vulnerability report.
//!
//! ## Guarantees
//!
//! - Reports are named after their SBOM and written with create-or-update,
//!   so redelivered or concurrent tasks converge on one report.
//! - A task whose ScanJob or SBOM is gone completes without a report.
//! - Every scan runs in a private workspace under the work directory that
//!   is removed on every exit path, cancellation included.

pub mod config;
pub mod consumer;
pub mod error;
pub mod handlers;
pub mod scanner;
pub mod seed;
pub mod vex;

pub use config::Config;
pub use consumer::{WorkerPool, WorkerPoolConfig};
pub use error::HandlerError;
pub use handlers::{Handler, ScanOutcome, ScanSbomHandler};
pub use scanner::{ScanInvocation, Scanner, ScannerConfig, ScannerError, TrivyScanner};
