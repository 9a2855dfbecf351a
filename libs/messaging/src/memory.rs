//! In-process message bus.
//!
//! Messages are retained per subject until a subscriber takes them, so
//! publishing before anyone subscribes loses nothing. Unsettled and
//! negatively acknowledged deliveries come back after the redelivery delay
//! until `max_deliver` attempts have been made.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, warn};
use vscan_api::MessageId;

use crate::{AckKind, BusError, Delivery, DeliverySource, MessageBus, Subscription};

/// Delivery policy of a [`MemoryBus`].
#[derive(Debug, Clone)]
pub struct MemoryBusConfig {
    /// Total delivery attempts per message before it is dropped.
    pub max_deliver: u32,
    /// Delay before a negatively acknowledged message is offered again.
    pub redelivery_delay: Duration,
}

impl Default for MemoryBusConfig {
    fn default() -> Self {
        Self {
            max_deliver: 5,
            redelivery_delay: Duration::from_secs(1),
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub naked: u64,
    pub terminated: u64,
    /// Messages dropped after exhausting `max_deliver`.
    pub dead_lettered: u64,
}

struct Envelope {
    id: MessageId,
    subject: String,
    payload: Bytes,
    attempt: u32,
}

#[derive(Default)]
struct Topic {
    pending: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Topic {
    fn pending(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, envelope: Envelope) {
        self.pending().push_back(envelope);
        self.notify.notify_one();
    }
}

struct Inner {
    config: MemoryBusConfig,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    stats: Mutex<BusStats>,
    closed: watch::Sender<bool>,
    /// Messages accepted and not yet acked, terminated or dropped.
    outstanding: AtomicUsize,
    injected_failures: AtomicU32,
}

impl Inner {
    fn topic(&self, subject: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(topics.entry(subject.to_string()).or_default())
    }

    fn stats(&self) -> MutexGuard<'_, BusStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn settle(&self, envelope: Envelope, outcome: AckKind) {
        match outcome {
            AckKind::Ack => self.stats().acked += 1,
            AckKind::Term => {
                self.stats().terminated += 1;
                warn!(
                    subject = %envelope.subject,
                    message_id = %envelope.id,
                    attempt = envelope.attempt,
                    "Message terminated by consumer"
                );
            }
            AckKind::Nak => {
                self.stats().naked += 1;
                if envelope.attempt >= self.config.max_deliver {
                    self.stats().dead_lettered += 1;
                    warn!(
                        subject = %envelope.subject,
                        message_id = %envelope.id,
                        attempts = envelope.attempt,
                        "Delivery limit reached, dropping message"
                    );
                } else {
                    tokio::time::sleep(self.config.redelivery_delay).await;
                    if !self.is_closed() {
                        debug!(
                            subject = %envelope.subject,
                            message_id = %envelope.id,
                            attempt = envelope.attempt + 1,
                            "Redelivering message"
                        );
                        let topic = self.topic(&envelope.subject);
                        topic.push(Envelope {
                            attempt: envelope.attempt + 1,
                            ..envelope
                        });
                        return;
                    }
                }
            }
        }
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// At-least-once bus living inside the process. Cheap to clone.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new(config: MemoryBusConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                topics: Mutex::new(HashMap::new()),
                stats: Mutex::new(BusStats::default()),
                closed,
                outstanding: AtomicUsize::new(0),
                injected_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `count` publishes fail as if the bus were unreachable.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.injected_failures.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> BusStats {
        *self.inner.stats()
    }

    /// Messages waiting for a subscriber on `subject`.
    pub fn pending(&self, subject: &str) -> usize {
        self.inner.topic(subject).pending().len()
    }

    /// True when every accepted message has been finally settled.
    pub fn is_idle(&self) -> bool {
        self.inner.outstanding.load(Ordering::SeqCst) == 0
    }

    /// Close the bus. Subscriptions end and publishes fail.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(MemoryBusConfig::default())
    }
}

fn validate_subject(subject: &str) -> Result<(), BusError> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<MessageId, BusError> {
        validate_subject(subject)?;
        if self.inner.is_closed() {
            return Err(BusError::Closed);
        }
        let injected = self
            .inner
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(BusError::Unavailable("injected failure".to_string()));
        }

        let id = MessageId::new();
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.inner.topic(subject).push(Envelope {
            id,
            subject: subject.to_string(),
            payload,
            attempt: 1,
        });
        self.inner.stats().published += 1;
        Ok(id)
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        validate_subject(subject)?;
        if self.inner.is_closed() {
            return Err(BusError::Closed);
        }
        let source = MemorySource {
            inner: Arc::clone(&self.inner),
            topic: self.inner.topic(subject),
            closed: self.inner.closed.subscribe(),
        };
        Ok(Subscription::new(subject, Box::new(source)))
    }
}

struct MemorySource {
    inner: Arc<Inner>,
    topic: Arc<Topic>,
    closed: watch::Receiver<bool>,
}

impl MemorySource {
    fn deliver(&self, envelope: Envelope) -> Delivery {
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery::new(
            envelope.id,
            envelope.subject.clone(),
            envelope.payload.clone(),
            envelope.attempt,
            tx,
        );

        self.inner.stats().delivered += 1;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // A dropped delivery is a negative acknowledgement.
            let outcome = rx.await.unwrap_or(AckKind::Nak);
            inner.settle(envelope, outcome).await;
        });

        delivery
    }
}

#[async_trait]
impl DeliverySource for MemorySource {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if *self.closed.borrow() {
                return None;
            }
            let notified = self.topic.notify.notified();
            let next = self.topic.pending().pop_front();
            if let Some(envelope) = next {
                return Some(self.deliver(envelope));
            }
            tokio::select! {
                _ = notified => {}
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
