//! # In-Memory Broker
//!
//! This module provides [`InMemoryBroker`], a [`BrokerTransport`] with the
//! same observable semantics as a confirmed-publish AMQP setup: exchange
//! bindings, per-queue pending/unacked delivery tracking, dead-letter
//! re-routing on rejection, and injectable publish-confirm failures for
//! exercising the reconciliation path.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use txmq_core::port::broker::{BrokerError, BrokerTransport, Delivery, QueueSpec};

/// Errors specific to the in-memory transport.
#[derive(Debug, Error)]
pub enum InMemoryBrokerError {
    /// Ack or nack referenced a delivery that is not outstanding.
    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),
}

#[derive(Default)]
struct QueueState {
    spec: Option<QueueSpec>,
    pending: VecDeque<Delivery>,
    unacked: HashMap<String, Delivery>,
}

#[derive(Default)]
struct BrokerState {
    /// (exchange, route_key) -> bound queues.
    bindings: HashMap<(String, String), Vec<String>>,
    queues: HashMap<String, QueueState>,
    /// Publishes to reject before confirming again.
    fail_publishes: usize,
    sequence: u64,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, route_key: &str, payload: &[u8]) {
        let key = (exchange.to_string(), route_key.to_string());
        let targets = self.bindings.get(&key).cloned().unwrap_or_default();

        for queue in targets {
            self.sequence += 1;
            let delivery = Delivery {
                message_id: format!("m-{}", self.sequence),
                queue: queue.clone(),
                exchange: exchange.to_string(),
                route_key: route_key.to_string(),
                payload: payload.to_vec(),
                redelivered: false,
                delivery_count: 1,
            };
            if let Some(state) = self.queues.get_mut(&queue) {
                state.pending.push_back(delivery);
            }
        }
    }
}

/// In-process broker with confirmed publishes and dead-letter routing.
///
/// Unroutable messages are confirmed and dropped, matching a broker without
/// mandatory publishing. [`InMemoryBroker::fail_next_publishes`] makes the
/// next N publishes come back negatively confirmed, which is how tests force
/// the ready-record resend path.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` publishes with a negative confirmation.
    pub async fn fail_next_publishes(&self, n: usize) {
        self.state.lock().await.fail_publishes = n;
    }

    /// Number of deliveries waiting in a queue.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    /// Number of fetched-but-unacknowledged deliveries on a queue.
    pub async fn unacked_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    type Error = InMemoryBrokerError;

    async fn declare(&self, spec: &QueueSpec) -> Result<(), BrokerError<InMemoryBrokerError>> {
        let mut state = self.state.lock().await;

        let queue = state.queues.entry(spec.queue.clone()).or_default();
        queue.spec = Some(spec.clone());

        let binding = (spec.exchange.clone(), spec.route_key.clone());
        let bound = state.bindings.entry(binding).or_default();
        if !bound.contains(&spec.queue) {
            bound.push(spec.queue.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        route_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError<InMemoryBrokerError>> {
        let mut state = self.state.lock().await;

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(BrokerError::PublishRejected);
        }

        state.route(exchange, route_key, payload);
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        _timeout: Duration,
    ) -> Result<Vec<Delivery>, BrokerError<InMemoryBrokerError>> {
        let mut state = self.state.lock().await;
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        };

        let n = max.min(queue_state.pending.len());
        let fetched: Vec<Delivery> = queue_state.pending.drain(..n).collect();
        for delivery in &fetched {
            queue_state
                .unacked
                .insert(delivery.message_id.clone(), delivery.clone());
        }
        Ok(fetched)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError<InMemoryBrokerError>> {
        let mut state = self.state.lock().await;
        let Some(queue_state) = state.queues.get_mut(&delivery.queue) else {
            return Err(BrokerError::UnknownQueue(delivery.queue.clone()));
        };

        queue_state
            .unacked
            .remove(&delivery.message_id)
            .map(|_| ())
            .ok_or_else(|| {
                BrokerError::Ack(InMemoryBrokerError::UnknownDelivery(
                    delivery.message_id.clone(),
                ))
            })
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        requeue: bool,
    ) -> Result<(), BrokerError<InMemoryBrokerError>> {
        let mut state = self.state.lock().await;

        let Some(queue_state) = state.queues.get_mut(&delivery.queue) else {
            return Err(BrokerError::UnknownQueue(delivery.queue.clone()));
        };
        let Some(mut outstanding) = queue_state.unacked.remove(&delivery.message_id) else {
            return Err(BrokerError::Nack(InMemoryBrokerError::UnknownDelivery(
                delivery.message_id.clone(),
            )));
        };

        if requeue {
            outstanding.redelivered = true;
            outstanding.delivery_count += 1;
            queue_state.pending.push_back(outstanding);
            return Ok(());
        }

        // Rejected outright: re-route through the queue's dead-letter pair,
        // or drop when none is configured.
        let dead_letter = queue_state.spec.as_ref().and_then(|s| s.dead_letter.clone());
        match dead_letter {
            Some(dl) => {
                tracing::debug!(queue = %delivery.queue, message_id = %delivery.message_id,
                    dlx = %dl.exchange, "delivery dead-lettered");
                state.route(&dl.exchange, &dl.route_key, &outstanding.payload);
            }
            None => {
                tracing::debug!(queue = %delivery.queue, message_id = %delivery.message_id,
                    "delivery dropped, no dead-letter pair");
            }
        }
        Ok(())
    }
}
