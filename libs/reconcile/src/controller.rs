//! Controller runner: a pool of workers draining a [`WorkQueue`] into a
//! [`Reconciler`].

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::WorkQueue;

/// What to do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing further until the next notification or resync.
    pub fn await_change() -> Self {
        Self::default()
    }

    /// Reconcile the key again after `delay`.
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// A level-triggered reconcile function keyed by resource identity.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Controller name for logging.
    fn name(&self) -> &'static str;

    /// Recompute and converge the state of one resource.
    async fn reconcile(&self, key: &Self::Key) -> Result<Action, Self::Error>;
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    pub workers: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

/// Runs a reconciler over a work queue until shutdown.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: WorkQueue<R::Key>,
    config: ControllerConfig,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, queue: WorkQueue<R::Key>, config: ControllerConfig) -> Self {
        Self {
            reconciler,
            queue,
            config,
        }
    }

    pub fn queue(&self) -> &WorkQueue<R::Key> {
        &self.queue
    }

    /// Run the worker pool until shutdown is signaled.
    ///
    /// In-flight reconciles finish before this returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.reconciler.name();
        let workers = self.config.workers.max(1);
        info!(controller = name, workers, "Starting controller");

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let queue = self.queue.clone();
            let reconciler = Arc::clone(&self.reconciler);
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, reconciler, queue).await;
            }));
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(controller = name, "Controller shutting down");
        self.queue.shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(controller = name, error = %e, "Controller worker panicked");
            }
        }
    }
}

async fn run_worker<R: Reconciler>(worker_id: usize, reconciler: Arc<R>, queue: WorkQueue<R::Key>) {
    let name = reconciler.name();
    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key).await {
            Ok(action) => {
                queue.forget(&key);
                if let Some(delay) = action.requeue_after() {
                    debug!(controller = name, key = %key, delay_ms = delay.as_millis() as u64, "Requeue requested");
                    queue.add_after(key.clone(), delay);
                }
            }
            Err(e) => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    controller = name,
                    worker_id,
                    key = %key,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconcile failed, requeued with backoff"
                );
            }
        }
        queue.done(&key);
    }
    debug!(controller = name, worker_id, "Controller worker stopped");
}
