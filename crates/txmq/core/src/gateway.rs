//! # Broker Gateway
//!
//! This module provides [`BrokerGateway`]: topology declaration, confirmed
//! publishing, and dispatch of inbound deliveries to registered processors.
//!
//! The gateway:
//! 1. Idempotently declares exchanges, queues, and dead-letter pairs
//! 2. Binds one [`Processor`] per queue in a dispatch table
//! 3. Fetches deliveries with prefetch-1 semantics and runs the processor
//! 4. Acks on success; on failure requeues until the retry budget is
//!    exhausted, then routes the delivery to the queue's dead-letter pair

use crate::port::broker::{BrokerError, BrokerTransport, Delivery, QueueSpec};
use crate::processor::{DeliveryMode, Processor, ProcessorError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};

/// Separator used when deriving dead-letter names from a topic.
pub const SPLIT: &str = ".";
/// Suffix of a per-topic dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE: &str = "dlx";
/// Suffix of a per-topic dead-letter queue.
pub const DEAD_LETTER_QUEUE: &str = "dlq";
/// Routing key used on dead-letter re-routes.
pub const DEAD_LETTER_ROUTE_KEY: &str = "dead_letter";

/// Derive the conventional dead-letter exchange name for a topic.
pub fn dead_letter_exchange(topic: &str) -> String {
    format!("{topic}{SPLIT}{DEAD_LETTER_EXCHANGE}")
}

/// Derive the conventional dead-letter queue name for a topic.
pub fn dead_letter_queue(topic: &str) -> String {
    format!("{topic}{SPLIT}{DEAD_LETTER_QUEUE}")
}

/// Configuration for [`BrokerGateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deliveries fetched per dispatch round. Kept at 1 so a single
    /// processor invocation is in flight per queue.
    pub prefetch: usize,
    /// Delivery attempts before a failing message is dead-lettered.
    pub max_deliver: u32,
    /// How long a fetch waits for a delivery.
    pub fetch_timeout: Duration,
    /// Idle interval between polling rounds in [`BrokerGateway::start`].
    pub poll_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            max_deliver: 3,
            fetch_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Outcome of one dispatch round on a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Deliveries fetched.
    pub fetched: usize,
    /// Deliveries acknowledged after successful processing.
    pub acked: usize,
    /// Deliveries returned to the queue for another attempt.
    pub requeued: usize,
    /// Deliveries routed to the dead-letter pair.
    pub dead_lettered: usize,
}

/// One registered queue binding.
struct ConsumerBinding {
    spec: QueueSpec,
    mode: DeliveryMode,
    processor: Arc<dyn Processor>,
}

/// Gateway over a [`BrokerTransport`]: declares topology, publishes with
/// confirmation, and dispatches deliveries to registered processors.
pub struct BrokerGateway<B: BrokerTransport> {
    transport: Arc<B>,
    config: GatewayConfig,
    bindings: Mutex<HashMap<String, Arc<ConsumerBinding>>>,
}

impl<B: BrokerTransport> BrokerGateway<B> {
    /// Create a gateway with default configuration.
    pub fn new(transport: Arc<B>) -> Self {
        Self::with_config(transport, GatewayConfig::default())
    }

    /// Create a gateway with custom configuration.
    pub fn with_config(transport: Arc<B>, config: GatewayConfig) -> Self {
        Self {
            transport,
            config,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<B> {
        &self.transport
    }

    /// Declare a queue binding and register its processor.
    ///
    /// Idempotent: re-adding the same queue re-declares the topology and
    /// replaces the processor.
    pub async fn add(
        &self,
        queue: &str,
        exchange: &str,
        route_key: &str,
        processor: Arc<dyn Processor>,
        mode: DeliveryMode,
    ) -> Result<(), BrokerError<B::Error>> {
        let spec = QueueSpec::new(queue, exchange, route_key);
        self.register(spec, processor, mode).await
    }

    /// Declare a queue binding with a dead-letter pair and register its
    /// processor.
    ///
    /// Deliveries the processor fails to handle after the retry budget are
    /// re-routed to `dl_exchange`/`dl_route_key`, where a recovery processor
    /// registered via [`BrokerGateway::add`] picks them up.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_dlx(
        &self,
        queue: &str,
        exchange: &str,
        route_key: &str,
        processor: Arc<dyn Processor>,
        mode: DeliveryMode,
        dl_exchange: &str,
        dl_route_key: &str,
    ) -> Result<(), BrokerError<B::Error>> {
        let spec = QueueSpec::new(queue, exchange, route_key)
            .with_dead_letter(dl_exchange, dl_route_key);
        self.register(spec, processor, mode).await
    }

    async fn register(
        &self,
        spec: QueueSpec,
        processor: Arc<dyn Processor>,
        mode: DeliveryMode,
    ) -> Result<(), BrokerError<B::Error>> {
        self.transport.declare(&spec).await?;
        tracing::info!(queue = %spec.queue, exchange = %spec.exchange, %mode, "consumer registered");

        let binding = Arc::new(ConsumerBinding {
            spec: spec.clone(),
            mode,
            processor,
        });
        self.bindings.lock().await.insert(spec.queue, binding);
        Ok(())
    }

    /// Publish a message and wait for broker confirmation.
    ///
    /// An `Err` means the message must be treated as not delivered; the
    /// caller keeps its ready record.
    pub async fn publish(
        &self,
        exchange: &str,
        route_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError<B::Error>> {
        self.transport.publish(exchange, route_key, payload).await
    }

    /// Run one dispatch round on a registered queue.
    pub async fn dispatch_once(&self, queue: &str) -> Result<DispatchReport, BrokerError<B::Error>> {
        let binding = self
            .bindings
            .lock()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

        let deliveries = self
            .transport
            .fetch(queue, self.config.prefetch, self.config.fetch_timeout)
            .await?;

        let mut report = DispatchReport {
            fetched: deliveries.len(),
            ..Default::default()
        };

        for delivery in deliveries {
            self.handle_delivery(&binding, &delivery, &mut report).await;
        }

        Ok(report)
    }

    async fn handle_delivery(
        &self,
        binding: &ConsumerBinding,
        delivery: &Delivery,
        report: &mut DispatchReport,
    ) {
        match binding.processor.process(delivery).await {
            Ok(()) => {
                if let Err(e) = self.transport.ack(delivery).await {
                    tracing::error!(queue = %delivery.queue, message_id = %delivery.message_id,
                        error = ?e, "ack failed, delivery will be redelivered");
                } else {
                    report.acked += 1;
                }
            }
            Err(error) => {
                self.handle_failure(binding, delivery, &error, report).await;
            }
        }
    }

    async fn handle_failure(
        &self,
        binding: &ConsumerBinding,
        delivery: &Delivery,
        error: &ProcessorError,
        report: &mut DispatchReport,
    ) {
        let requeue = match binding.mode {
            // Ordinary consumers carry no retry machinery; the first failure
            // dead-letters (or drops) the delivery.
            DeliveryMode::Ordinary => false,
            DeliveryMode::Distributed => delivery.delivery_count < self.config.max_deliver,
            // Dead-letter consumers get no second-level dead-letter: requeue
            // until compensation succeeds, the daemon remains the backstop.
            DeliveryMode::DeadLetter => true,
        };

        tracing::warn!(queue = %delivery.queue, message_id = %delivery.message_id,
            delivery_count = delivery.delivery_count, requeue, %error,
            "processor failed");

        match self.transport.nack(delivery, requeue).await {
            Ok(()) if requeue => report.requeued += 1,
            Ok(()) => {
                if binding.spec.dead_letter.is_some() {
                    report.dead_lettered += 1;
                }
            }
            Err(e) => {
                tracing::error!(queue = %delivery.queue, message_id = %delivery.message_id,
                    error = ?e, "nack failed");
            }
        }
    }

    /// Poll all registered queues until `shutdown` fires.
    pub async fn start(&self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("gateway dispatch loop stopping");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let queues: Vec<String> =
                        self.bindings.lock().await.keys().cloned().collect();
                    for queue in queues {
                        if let Err(e) = self.dispatch_once(&queue).await {
                            tracing::error!(queue = %queue, error = ?e, "dispatch round failed");
                        }
                    }
                }
            }
        }
    }
}
