//! # txmq-sqlite
//!
//! Durable SQLite adapters for the txmq protocol ports:
//!
//! - [`SqliteCoordinator`]: prepare/ready records and consumer-side applied
//!   markers that survive process restart
//! - [`SqliteLockManager`]: an expiring named lock with statement-level
//!   check-and-set, shared across producer replicas via the database
//!
//! Both can share one pool:
//!
//! ```rust,no_run
//! use txmq_sqlite::{SqliteCoordinator, SqliteLockManager};
//!
//! # async fn wire() -> Result<(), sqlx::Error> {
//! let coordinator = SqliteCoordinator::new("sqlite://txmq.db").await?;
//! let lock = SqliteLockManager::from_pool(coordinator.pool().clone()).await?;
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod lock;

pub use coordinator::SqliteCoordinator;
pub use lock::SqliteLockManager;
