//! # Checkback Query Port
//!
//! Durable business-side lookup by checkback id, used exclusively by the
//! prepare sweep to decide between discarding a stale prepare record and
//! re-publishing on behalf of a crashed bridge.

use crate::message::CheckbackId;
use async_trait::async_trait;
use thiserror::Error;

/// Errors from the checkback lookup.
#[derive(Debug, Error)]
pub enum CheckbackError {
    /// The owning service's store could not be queried.
    #[error("checkback query failed: {0}")]
    Query(String),
}

/// Lookup into the producing service's durable store.
///
/// `fetch` answers two questions at once: whether the local operation keyed
/// by `checkback_id` completed, and, when it did, what transfer data a
/// resend should carry. A prepare record may predate the message payload
/// entirely, so the sweep must be able to rebuild it from the business row.
#[async_trait]
pub trait CheckbackQuery: Send + Sync {
    /// Return the transfer data for a completed local operation, or `None`
    /// when no durable record exists for the id.
    async fn fetch(
        &self,
        checkback_id: &CheckbackId,
    ) -> Result<Option<serde_json::Value>, CheckbackError>;
}
