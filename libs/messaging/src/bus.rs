//! The message bus interface.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use vscan_api::MessageId;

use crate::BusError;

/// How a consumer settled a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processed; never redeliver.
    Ack,
    /// Not processed; redeliver if the delivery limit allows.
    Nak,
    /// Unprocessable; never redeliver.
    Term,
}

/// One delivery of a message to a consumer.
///
/// Settling consumes the delivery. Dropping it unsettled counts as a
/// negative acknowledgement.
#[derive(Debug)]
pub struct Delivery {
    pub id: MessageId,
    pub subject: String,
    pub payload: Bytes,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    reply: Option<oneshot::Sender<AckKind>>,
}

impl Delivery {
    pub fn new(
        id: MessageId,
        subject: impl Into<String>,
        payload: Bytes,
        attempt: u32,
        reply: oneshot::Sender<AckKind>,
    ) -> Self {
        Self {
            id,
            subject: subject.into(),
            payload,
            attempt,
            reply: Some(reply),
        }
    }

    pub fn ack(self) {
        self.settle(AckKind::Ack);
    }

    pub fn nak(self) {
        self.settle(AckKind::Nak);
    }

    pub fn term(self) {
        self.settle(AckKind::Term);
    }

    fn settle(mut self, kind: AckKind) {
        if let Some(reply) = self.reply.take() {
            // The bus may already be gone; nothing left to settle then.
            let _ = reply.send(kind);
        }
    }
}

/// A stream of deliveries for one subscription.
#[async_trait]
pub trait DeliverySource: Send {
    /// Next delivery, or `None` once the subscription is closed.
    async fn next(&mut self) -> Option<Delivery>;
}

/// A subscription to one subject.
///
/// Subscribers of the same subject share the work: each message goes to
/// exactly one of them per delivery attempt.
pub struct Subscription {
    subject: String,
    source: Box<dyn DeliverySource>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, source: Box<dyn DeliverySource>) -> Self {
        Self {
            subject: subject.into(),
            source,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.source.next().await
    }
}

/// Durable publish/subscribe channel with at-least-once delivery.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Durably accept one message on `subject`.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<MessageId, BusError>;

    /// Join the consumer group of `subject`.
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;
}
