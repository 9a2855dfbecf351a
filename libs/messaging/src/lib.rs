//! # vscan-messaging
//!
//! The bus between the controller and scan workers.
//!
//! Delivery is at-least-once: a consumer acknowledges each [`Delivery`]
//! explicitly. A negative acknowledgement (or a delivery dropped without
//! any acknowledgement) is redelivered until the bus's delivery limit is
//! reached; a terminated delivery is never redelivered.
//!
//! [`TaskPublisher`] wraps a [`MessageBus`] with publish retry and a
//! cooperative drain for shutdown.

mod bus;
mod config;
mod error;
mod memory;
mod publisher;

pub use bus::{AckKind, Delivery, DeliverySource, MessageBus, Subscription};
pub use config::BusConfig;
pub use error::{BusError, PublishError};
pub use memory::{BusStats, MemoryBus, MemoryBusConfig};
pub use publisher::{PublisherConfig, TaskPublisher};
