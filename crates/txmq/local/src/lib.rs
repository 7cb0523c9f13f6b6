//! # txmq-local
//!
//! In-process adapters for the txmq protocol ports:
//!
//! - [`InMemoryBroker`]: a broker transport with bindings, confirmed
//!   publishes, dead-letter routing, and injectable confirm failures
//! - [`InMemoryCoordinator`]: a non-durable coordinator store
//! - [`InMemoryLockManager`]: a TTL lock table
//!
//! None of these survive a process restart. They exist so the full
//! prepare/ready lifecycle, the dispatch path, and the reconciliation daemon
//! can be exercised end to end without external infrastructure.

pub mod broker;
pub mod coordinator;
pub mod lock;

pub use broker::{InMemoryBroker, InMemoryBrokerError};
pub use coordinator::{InMemoryCoordinator, InMemoryCoordinatorError};
pub use lock::InMemoryLockManager;
