//! # txmq-core
//!
//! Core protocol engine for reliable cross-service transactions over an
//! asynchronous message broker, with zero infrastructure dependencies.
//!
//! A producing service performs a local state change and must eventually
//! notify downstream services exactly-once-effectively, even though the
//! local commit and the broker publish cannot be made atomic. txmq provides
//! at-least-once, idempotent-consumer delivery with eventual convergence:
//!
//! - [`bridge`]: [`PublishCommitBridge`] wraps a business operation so the
//!   prepare record, the local transaction, the ready record, and the
//!   confirmed publish happen in an order every crash point can recover from
//! - [`daemon`]: [`ReconciliationDaemon`] resolves stuck prepare/ready
//!   records by re-checking local completion and resending or discarding
//! - [`gateway`]: [`BrokerGateway`] declares topology, publishes with
//!   confirmation, and dispatches deliveries to registered processors with
//!   retry-then-dead-letter semantics
//! - [`port`]: traits for the durable coordinator store, the advisory
//!   distributed lock, the broker transport, and the checkback query
//! - [`message`]: the prepare/ready records and the wire payload
//!
//! Adapters live in companion crates: `txmq-local` (in-process broker and
//! stores) and `txmq-sqlite` (durable coordinator and lock).

pub mod bridge;
pub mod daemon;
pub mod gateway;
pub mod message;
pub mod port;
pub mod processor;
pub mod telemetry;

pub use bridge::{BridgeError, PublishCommitBridge};
pub use daemon::{
    CycleOutcome, DaemonConfig, DaemonError, DaemonMetrics, ReconciliationDaemon, SweepReport,
};
pub use gateway::{
    BrokerGateway, DispatchReport, GatewayConfig, dead_letter_exchange, dead_letter_queue,
    DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, DEAD_LETTER_ROUTE_KEY, SPLIT,
};
pub use message::{CheckbackId, MessageRoute, PrepareRecord, ReadyRecord, TransferBean};
pub use port::{
    BrokerError, BrokerTransport, CheckbackError, CheckbackQuery, Coordinator, DeadLetterSpec,
    Delivery, LockError, LockManager, LockToken, QueueSpec, with_lock,
};
pub use processor::{DeliveryMode, Processor, ProcessorError, decode_bean};
pub use telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
