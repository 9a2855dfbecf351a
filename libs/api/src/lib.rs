//! # vscan-api
//!
//! Resource types, identifiers and wire messages shared by the vscan
//! controller and worker.
//!
//! ## Resources
//!
//! All records live in the resource store and share an [`ObjectMeta`]
//! header (name, namespace, uid, resource version, labels, owner
//! references). The known kinds are listed once in [`ResourceKind`]:
//!
//! - `Registry`: a reachable image source (read-only to the pipeline)
//! - `ScanJob`: one requested scan run, with a status subresource
//! - `Sbom`: per-image software inventory (the scan input)
//! - `VulnerabilityReport`: per-SBOM findings (the scan output)
//! - `VexHub`: a cluster-wide VEX enrichment feed
//!
//! ## Relationships
//!
//! - ScanJob → Sbom is a label correlation (`scanjob=<name>`), not an
//!   ownership link, so the two are garbage-collected independently.
//! - Sbom → VulnerabilityReport is an owner reference; deleting the SBOM
//!   cascades to its report.
//!
//! ## Identifiers
//!
//! Store-assigned identifiers use the prefixed ULID format
//! `{prefix}_{ulid}`, e.g. `uid_01HV4Z2WQXKJNM8GPQY6VBKC3D`.

mod error;
mod id;
mod kind;
mod message;
mod meta;
mod types;

pub use error::{ApiError, IdError};
pub use id::{MessageId, ObjectUid};
pub use kind::{KindInfo, Resource, ResourceKind};
pub use message::{ScanSbomMessage, SCAN_SBOM_SUBJECT};
pub use meta::*;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
