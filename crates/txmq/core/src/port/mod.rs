//! Ports for infrastructure adapters.
//!
//! Each port is a trait the protocol engine depends on and an adapter crate
//! implements: the durable coordinator store, the advisory distributed lock,
//! the broker transport, and the business-side checkback lookup.

pub mod broker;
pub mod checkback;
pub mod coordinator;
pub mod lock;

pub use broker::{BrokerError, BrokerTransport, DeadLetterSpec, Delivery, QueueSpec};
pub use checkback::{CheckbackError, CheckbackQuery};
pub use coordinator::Coordinator;
pub use lock::{LockError, LockManager, LockToken, with_lock};
