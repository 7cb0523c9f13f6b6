//! # Broker Transport Port
//!
//! This module defines the [`BrokerTransport`] trait: the seam between the
//! protocol engine and the broker client. The broker's own wire protocol is
//! out of scope; an AMQP client adapter implements this trait, and
//! `txmq-local` provides an in-process implementation with the same
//! semantics for tests and single-node deployments.
//!
//! # Semantics the transport must honor
//!
//! - `declare` is idempotent: re-declaring an existing queue, exchange
//!   binding, or dead-letter pair must not fail or duplicate topology.
//! - `publish` resolves only after the broker confirms the message; a
//!   negative confirmation or timeout is [`BrokerError::PublishRejected`].
//! - `fetch` is pull-based; fetched deliveries stay unacknowledged until
//!   `ack` or `nack`.
//! - `nack(requeue = true)` returns the delivery to its queue with an
//!   incremented delivery count; `nack(requeue = false)` re-routes it to the
//!   queue's dead-letter pair, or drops it when none is configured.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

/// Errors from broker transport operations, generic over the backend's own
/// error type.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError<E> {
    /// Topology declaration failed.
    #[error("declare failed: {0:?}")]
    Declare(E),

    /// The publish could not be handed to the broker.
    #[error("publish failed: {0:?}")]
    Publish(E),

    /// The broker negatively acknowledged the publish or the confirmation
    /// timed out. The message must be treated as not delivered.
    #[error("publish rejected by broker")]
    PublishRejected,

    /// Fetching deliveries failed.
    #[error("fetch failed: {0:?}")]
    Fetch(E),

    /// Acknowledgment failed.
    #[error("ack failed: {0:?}")]
    Ack(E),

    /// Negative acknowledgment failed.
    #[error("nack failed: {0:?}")]
    Nack(E),

    /// The queue is not declared on this transport.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

/// Dead-letter destination for a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterSpec {
    /// Exchange that receives exhausted deliveries.
    pub exchange: String,
    /// Routing key used for the re-route.
    pub route_key: String,
}

/// Declaration of a queue and its binding.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    /// Queue name.
    pub queue: String,
    /// Exchange the queue is bound to.
    pub exchange: String,
    /// Routing key of the binding.
    pub route_key: String,
    /// Optional dead-letter destination for rejected deliveries.
    pub dead_letter: Option<DeadLetterSpec>,
}

impl QueueSpec {
    /// Declare a queue bound to `exchange` with `route_key`.
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        route_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            route_key: route_key.into(),
            dead_letter: None,
        }
    }

    /// Attach a dead-letter destination.
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        route_key: impl Into<String>,
    ) -> Self {
        self.dead_letter = Some(DeadLetterSpec {
            exchange: exchange.into(),
            route_key: route_key.into(),
        });
        self
    }
}

/// A message received from a queue, pending acknowledgment.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Transport-assigned id, required for ack/nack.
    pub message_id: String,
    /// Queue the delivery was fetched from.
    pub queue: String,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub route_key: String,
    /// Raw message payload.
    pub payload: Vec<u8>,
    /// Whether this delivery was seen before.
    pub redelivered: bool,
    /// Number of delivery attempts, starting at 1.
    pub delivery_count: u32,
}

/// Pull-based broker transport with publisher confirms and dead-letter
/// routing.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// The error type for this implementation.
    type Error: Debug + Send + Sync + 'static;

    /// Idempotently ensure the queue, its binding, and its dead-letter pair
    /// exist.
    async fn declare(&self, spec: &QueueSpec) -> Result<(), BrokerError<Self::Error>>;

    /// Publish a message and wait for broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        route_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError<Self::Error>>;

    /// Fetch up to `max` deliveries from `queue`, waiting at most `timeout`.
    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Delivery>, BrokerError<Self::Error>>;

    /// Acknowledge a delivery, removing it from the queue permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError<Self::Error>>;

    /// Negatively acknowledge a delivery.
    ///
    /// With `requeue` the delivery returns to its queue for another attempt;
    /// without it the delivery is dead-lettered (or dropped when the queue
    /// has no dead-letter pair).
    async fn nack(&self, delivery: &Delivery, requeue: bool)
        -> Result<(), BrokerError<Self::Error>>;
}
