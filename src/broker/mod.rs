//! Message broker abstraction.
//!
//! The pipeline talks to the bus through three seams:
//! - [`DeliverySource`] — yields deliveries from a queue, one at a time
//! - [`DeliveryHandle`] — settles one delivery (ack / reject)
//! - [`ApprovalPublisher`] — puts approval notifications on an exchange
//!
//! `rabbitmq` implements all three on top of lapin.

pub mod rabbitmq;

use async_trait::async_trait;

use crate::error::{BrokerError, PublishError};
use crate::pipeline::types::{ApprovalNotification, Envelope};

pub use rabbitmq::{AmqpApprovalPublisher, AmqpDeliverySource, ConnectionState, RabbitMqAdapter};

/// Settles a single delivery on the broker session it came from.
#[async_trait]
pub trait DeliveryHandle: Send {
    /// Mark delivered-and-done.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Hand the message back. With `requeue == false` the broker drops it
    /// (or dead-letters it, if the queue is configured to).
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// A delivery pulled from the queue, not yet settled.
pub struct Delivery {
    pub envelope: Envelope,
    pub handle: Box<dyn DeliveryHandle>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Ordered stream of deliveries from one queue.
#[async_trait]
pub trait DeliverySource: Send {
    /// Next delivery in broker order. `None` when the stream has ended.
    ///
    /// Must be cancel-safe: dropping the future before it resolves must not
    /// lose a delivery.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Stop receiving new deliveries.
    async fn close(&mut self);
}

/// Publishes approval notifications onto the bus.
#[async_trait]
pub trait ApprovalPublisher: Send + Sync {
    async fn publish(&self, notification: &ApprovalNotification) -> Result<(), PublishError>;
}
