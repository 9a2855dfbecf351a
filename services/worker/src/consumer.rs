//! Consumer pool.
//!
//! Each consumer owns one subscription and handles one delivery at a time,
//! so the pool size bounds the number of concurrent scans. Outcomes map to
//! acknowledgements:
//!
//! | Outcome | Ack |
//! |---|---|
//! | handled | ack |
//! | retryable error | nak, redelivered by the bus |
//! | malformed payload | term |
//! | shutdown mid-task | nak |
//!
//! On shutdown the in-flight handler future is dropped, which kills the
//! scanner subprocess and removes its workspace.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vscan_messaging::{BusError, Delivery, MessageBus, Subscription};

use crate::handlers::Handler;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Concurrent consumers.
    pub concurrency: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { concurrency: 2 }
    }
}

pub struct WorkerPool {
    bus: Arc<dyn MessageBus>,
    handler: Arc<dyn Handler>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(bus: Arc<dyn MessageBus>, handler: Arc<dyn Handler>, config: WorkerPoolConfig) -> Self {
        Self {
            bus,
            handler,
            config,
        }
    }

    /// Consume until `shutdown` flips to true or the bus closes.
    ///
    /// Fails only if a subscription cannot be established.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), BusError> {
        let subject = self.handler.subject().to_string();
        let concurrency = self.config.concurrency.max(1);

        let mut consumers: Vec<JoinHandle<()>> = Vec::with_capacity(concurrency);
        for id in 0..concurrency {
            let subscription = match self.bus.subscribe(&subject).await {
                Ok(s) => s,
                Err(e) => {
                    for consumer in &consumers {
                        consumer.abort();
                    }
                    return Err(e);
                }
            };
            consumers.push(tokio::spawn(consume(
                id,
                subscription,
                Arc::clone(&self.handler),
                shutdown.clone(),
            )));
        }
        info!(subject = %subject, concurrency, "Worker pool started");

        for consumer in consumers {
            if let Err(e) = consumer.await {
                error!(error = %e, "Consumer panicked");
            }
        }
        info!(subject = %subject, "Worker pool stopped");
        Ok(())
    }
}

async fn consume(
    id: usize,
    mut subscription: Subscription,
    handler: Arc<dyn Handler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => break,
            delivery = subscription.next() => match delivery {
                Some(d) => d,
                None => {
                    debug!(consumer = id, "Subscription closed");
                    break;
                }
            },
        };
        process(id, handler.as_ref(), delivery, &mut shutdown).await;
    }
    debug!(consumer = id, "Consumer stopped");
}

async fn process(
    id: usize,
    handler: &dyn Handler,
    delivery: Delivery,
    shutdown: &mut watch::Receiver<bool>,
) {
    let message_id = delivery.id;
    let attempt = delivery.attempt;
    debug!(consumer = id, %message_id, attempt, "Handling delivery");

    let outcome = tokio::select! {
        result = handler.handle(&delivery.payload) => Some(result),
        _ = cancelled(shutdown) => None,
    };

    match outcome {
        Some(Ok(())) => delivery.ack(),
        Some(Err(e)) if e.is_retryable() => {
            warn!(consumer = id, %message_id, attempt, error = %e, "Task failed, requesting redelivery");
            delivery.nak();
        }
        Some(Err(e)) => {
            error!(consumer = id, %message_id, attempt, error = %e, "Task rejected permanently");
            delivery.term();
        }
        None => {
            info!(consumer = id, %message_id, "Shutdown interrupted task, returning it to the bus");
            delivery.nak();
        }
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
