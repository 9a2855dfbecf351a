//! Task publisher: retrying publishes with a cooperative shutdown drain.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use vscan_api::{MessageId, ScanSbomMessage, SCAN_SBOM_SUBJECT};
use vscan_reconcile::BackoffPolicy;

use crate::{MessageBus, PublishError};

/// Publisher retry policy.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Attempts per message, the first one included.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy {
                base: Duration::from_millis(200),
                max: Duration::from_secs(5),
                jitter: 0.25,
            },
        }
    }
}

struct State {
    closing: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    cancel: watch::Sender<bool>,
}

/// Decrements the in-flight count when a publish finishes, however it ends.
struct InFlight<'a>(&'a State);

impl<'a> InFlight<'a> {
    fn enter(state: &'a State) -> Self {
        state.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Publishes task messages on behalf of the reconcilers. Cheap to clone.
///
/// Transient bus failures are retried with backoff before the error is
/// surfaced; the caller requeues on error. A failed publish is never
/// reported as success.
#[derive(Clone)]
pub struct TaskPublisher {
    bus: Arc<dyn MessageBus>,
    config: PublisherConfig,
    state: Arc<State>,
}

impl TaskPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, config: PublisherConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            bus,
            config,
            state: Arc::new(State {
                closing: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                cancel,
            }),
        }
    }

    /// Publish one scan task.
    pub async fn publish_scan(&self, task: &ScanSbomMessage) -> Result<MessageId, PublishError> {
        let payload = Bytes::from(task.encode()?);
        self.publish(SCAN_SBOM_SUBJECT, payload).await
    }

    /// Publish a raw payload, retrying transient failures.
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<MessageId, PublishError> {
        if self.state.closing.load(Ordering::SeqCst) {
            return Err(PublishError::ShuttingDown);
        }
        let _guard = InFlight::enter(&self.state);
        let mut cancel = self.state.cancel.subscribe();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.bus.publish(subject, payload.clone()).await {
                Ok(id) => {
                    debug!(subject, message_id = %id, attempt, "Published message");
                    return Ok(id);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                error!(subject, error = %err, "Publish rejected by bus");
                return Err(PublishError::Bus(err));
            }
            if attempt >= self.config.max_attempts {
                error!(subject, attempts = attempt, error = %err, "Publish retries exhausted");
                return Err(PublishError::Exhausted {
                    subject: subject.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.config.backoff.delay(attempt - 1);
            warn!(
                subject,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Publish failed, retrying"
            );
            if *cancel.borrow() {
                return Err(PublishError::Cancelled {
                    subject: subject.to_string(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => {
                    return Err(PublishError::Cancelled {
                        subject: subject.to_string(),
                    });
                }
            }
        }
    }

    /// Number of publishes currently in progress.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.state.closing.load(Ordering::SeqCst)
    }

    /// Stop accepting publishes and wait for in-flight ones to finish.
    ///
    /// Publishes still retrying when `timeout` elapses are cancelled.
    /// Returns true if everything drained in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.state.closing.store(true, Ordering::SeqCst);
        info!(in_flight = self.in_flight(), "Draining task publisher");

        let wait_idle = async {
            loop {
                let notified = self.state.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait_idle).await {
            Ok(()) => {
                info!("Task publisher drained");
                true
            }
            Err(_) => {
                warn!(
                    in_flight = self.in_flight(),
                    "Drain timed out, cancelling in-flight publishes"
                );
                self.abort();
                false
            }
        }
    }

    /// Cancel every in-flight publish and refuse new ones.
    pub fn abort(&self) {
        self.state.closing.store(true, Ordering::SeqCst);
        self.state.cancel.send_replace(true);
    }
}
