//! # Processor
//!
//! This module defines the [`Processor`] trait invoked by the gateway for
//! each delivery, and the delivery modes that select how a queue binding is
//! consumed.
//!
//! Processors are registered per queue at topology-declaration time (a
//! dispatch table, not an inheritance hierarchy). A processor runs inside
//! the consumer's local transaction: returning `Ok` commits and acknowledges
//! the delivery, returning `Err` rolls back and negatively acknowledges it,
//! leaving retry and dead-letter routing to the gateway's policy.

use crate::message::TransferBean;
use crate::port::broker::Delivery;
use async_trait::async_trait;
use thiserror::Error;

/// How a queue binding is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Plain consumption without transactional guarantees: no retries, a
    /// failed delivery is dead-lettered (or dropped) immediately.
    Ordinary,
    /// Distributed-transaction consumption: retries then dead-letter
    /// routing on processor failure.
    Distributed,
    /// Dead-letter consumption: the processor is a recovery handler whose
    /// successful compensation breaks the retry loop.
    DeadLetter,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Ordinary => write!(f, "ordinary"),
            DeliveryMode::Distributed => write!(f, "distributed"),
            DeliveryMode::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

/// Errors a processor can signal.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The payload could not be decoded as a [`TransferBean`].
    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// The business effect failed and the local transaction rolled back.
    #[error("processing failed: {0}")]
    Failed(String),
}

impl ProcessorError {
    /// Signal a business failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Handler bound to a queue.
///
/// Consumer-side idempotency is mandatory: repeated deliveries of the same
/// checkback id must not double-apply the effect. Implementations check a
/// persisted "already applied" marker (see
/// [`Coordinator::try_mark_applied`](crate::port::Coordinator::try_mark_applied))
/// before mutating state.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process one delivery.
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessorError>;
}

/// Decode the delivery payload as the protocol wire form.
pub fn decode_bean(delivery: &Delivery) -> Result<TransferBean, ProcessorError> {
    Ok(TransferBean::from_bytes(&delivery.payload)?)
}
