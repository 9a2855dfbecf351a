//! # vscan-store
//!
//! The resource store is the single source of truth for the pipeline. It is
//! external to the orchestration core; this crate defines the interface the
//! core relies on and ships an in-memory implementation used by the
//! embedded dev mode and by tests.
//!
//! ## Contract
//!
//! - Records are addressed by kind + namespace/name and carry a store-assigned
//!   uid and a monotonically increasing `resource_version`.
//! - Updates are compare-and-swap on `resource_version`; a stale version is a
//!   [`StoreError::Conflict`].
//! - Every write produces a [`WatchEvent`] on the broadcast watch channel.
//! - Deleting an object garbage-collects every object that lists it as an
//!   owner.

mod client;
mod error;
mod memory;
mod store;

pub use client::{Client, OperationResult};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use store::{ResourceStore, WatchEvent, WatchEventType};
