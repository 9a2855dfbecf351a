//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing level-triggered control
//! loops. Key concepts:
//!
//! - **Work queue**: deduplicates keys and guarantees at most one active
//!   reconcile per key; keys that change while being processed are
//!   re-queued once processing finishes.
//! - **Reconciler**: a function from a key to an [`Action`], recomputing
//!   state from scratch on every call.
//! - **Backoff**: failed reconciles are re-queued with exponential backoff
//!   and no hard ceiling; callers bound domain-level failures with a
//!   [`RetryTracker`].
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - A key is never processed by two workers at once

mod backoff;
mod controller;
mod hash;
mod queue;
mod retry;

use std::time::Duration;

use thiserror::Error;

pub use backoff::BackoffPolicy;
pub use controller::{Action, Controller, ControllerConfig, Reconciler};
pub use hash::ContentHash;
pub use queue::WorkQueue;
pub use retry::RetryTracker;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A local cache has not yet observed objects the store already holds.
    #[error("cache not synced for {0}")]
    NotSynced(String),
}

/// Default periodic resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default retry limit per resource within the retry window.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
