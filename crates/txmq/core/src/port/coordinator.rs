//! # Coordinator Port
//!
//! This module defines the [`Coordinator`] trait: the durable key-value
//! record of in-flight cross-service messages, keyed by checkback id.
//!
//! The coordinator is the source of truth for "a message is still owed".
//! Recovery after a producer crash depends entirely on it, so production
//! implementations must survive process restart.
//!
//! # Contract
//!
//! Every operation must be idempotent under retry:
//! - a duplicate `put_*` with the same checkback id overwrites,
//! - a `del_*` on an absent key is a no-op, not an error,
//! - `get_*` return a snapshot, not a live cursor; callers must tolerate
//!   records vanishing between the snapshot and their own mutation.
//!
//! Individual record operations must be safe under concurrent,
//! unsynchronized access from multiple producer instances; the distributed
//! lock only bounds duplicate-resend amplification, it is not required for
//! correctness.

use crate::message::{CheckbackId, PrepareRecord, ReadyRecord};
use async_trait::async_trait;

/// Durable store for prepare and ready records.
///
/// The bridge and the reconciliation daemon only read and mutate records
/// through this API and never cache them across calls.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Error type for store operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Write (or overwrite) a prepare record.
    async fn put_prepare(&self, record: PrepareRecord) -> Result<(), Self::Error>;

    /// Snapshot of all prepare records.
    async fn get_prepare(&self) -> Result<Vec<PrepareRecord>, Self::Error>;

    /// Delete a prepare record; absent keys are a no-op.
    async fn del_prepare(&self, checkback_id: &CheckbackId) -> Result<(), Self::Error>;

    /// Write (or overwrite) a ready record.
    async fn put_ready(&self, record: ReadyRecord) -> Result<(), Self::Error>;

    /// Snapshot of all ready records.
    async fn get_ready(&self) -> Result<Vec<ReadyRecord>, Self::Error>;

    /// Delete a ready record; absent keys are a no-op.
    async fn del_ready(&self, checkback_id: &CheckbackId) -> Result<(), Self::Error>;

    /// Consumer-side "already applied" marker: set-if-absent on the
    /// checkback id.
    ///
    /// Returns `true` exactly once per id across all callers. Processors
    /// check this before mutating state so that redelivery after a lost
    /// acknowledgment never double-applies the business effect.
    async fn try_mark_applied(&self, checkback_id: &CheckbackId) -> Result<bool, Self::Error>;
}
