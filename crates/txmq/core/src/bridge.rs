//! # Publish-Commit Bridge
//!
//! This module provides [`PublishCommitBridge`], the wrapper that makes a
//! local business operation and its downstream notification converge:
//!
//! 1. Write a prepare record before the business operation runs
//! 2. Run the operation inside its own local transaction
//! 3. On local commit, write the ready record and delete the prepare record
//! 4. Publish with confirmation and delete the ready record on success
//!
//! The local commit and the durable "I owe a message" marker are both
//! established before the publish attempt, because publish is the least
//! reliable link. A failure at any step leaves the coordinator in a state
//! the reconciliation daemon can repair: a lone prepare record resolves via
//! the checkback query, a lone ready record resolves via resend.

use crate::message::{CheckbackId, MessageRoute, PrepareRecord, ReadyRecord, TransferBean};
use crate::port::broker::BrokerTransport;
use crate::port::coordinator::Coordinator;
use crate::gateway::BrokerGateway;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced to the bridge caller.
///
/// Only failures that happen before the local commit are caller-visible.
/// Coordinator or publish failures after the commit are logged and left for
/// the daemon; the business effect already exists and must not look failed.
#[derive(Debug, Error)]
pub enum BridgeError<E> {
    /// The prepare record could not be written; the business operation was
    /// never started.
    #[error("prepare record write failed")]
    Prepare(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The business operation failed and its local transaction rolled back.
    #[error("local operation failed: {0}")]
    LocalOperation(#[source] E),
}

/// Wraps business operations with the prepare/ready protocol.
pub struct PublishCommitBridge<C, B>
where
    C: Coordinator,
    B: BrokerTransport,
{
    coordinator: Arc<C>,
    gateway: Arc<BrokerGateway<B>>,
}

impl<C, B> PublishCommitBridge<C, B>
where
    C: Coordinator,
    B: BrokerTransport,
{
    /// Create a bridge over a coordinator store and a broker gateway.
    pub fn new(coordinator: Arc<C>, gateway: Arc<BrokerGateway<B>>) -> Self {
        Self {
            coordinator,
            gateway,
        }
    }

    /// Execute `op` under the publish-commit protocol.
    ///
    /// `op` owns its local transaction boundary and returns the
    /// [`TransferBean`] to deliver downstream; `checkback_id` must be the
    /// key under which the committed business record can later be found by
    /// the checkback query.
    ///
    /// On success the bean is returned even when the publish itself failed;
    /// the ready record then remains for the daemon to resend.
    pub async fn execute<F, Fut, E>(
        &self,
        route: &MessageRoute,
        checkback_id: CheckbackId,
        op: F,
    ) -> Result<TransferBean, BridgeError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TransferBean, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        // Step 1: durable intent marker, before any side effect.
        self.coordinator
            .put_prepare(PrepareRecord::new(checkback_id.clone(), route))
            .await
            .map_err(|e| BridgeError::Prepare(Box::new(e)))?;

        // Step 2: the guarded business operation.
        let bean = match op().await {
            Ok(bean) => bean,
            Err(e) => {
                // Nothing happened locally, so nothing is owed downstream.
                if let Err(del) = self.coordinator.del_prepare(&checkback_id).await {
                    tracing::warn!(checkback_id = %checkback_id, error = %del,
                        "prepare cleanup failed, daemon will discard it");
                }
                return Err(BridgeError::LocalOperation(e));
            }
        };

        // Step 3: the commit happened; swap prepare for ready. A crash or
        // store failure between the two writes leaves either record alone,
        // and either alone is enough for the daemon to reconstruct intent.
        if let Err(e) = self
            .coordinator
            .put_ready(ReadyRecord::new(route, &bean))
            .await
        {
            tracing::error!(checkback_id = %checkback_id, error = %e,
                "ready record write failed, prepare record left for reconciliation");
            return Ok(bean);
        }
        if let Err(e) = self.coordinator.del_prepare(&checkback_id).await {
            tracing::warn!(checkback_id = %checkback_id, error = %e,
                "prepare delete failed, daemon will republish idempotently");
        }

        // Step 4: confirmed publish; failure defers to the daemon.
        self.publish_ready(route, &bean).await;

        Ok(bean)
    }

    async fn publish_ready(&self, route: &MessageRoute, bean: &TransferBean) {
        let payload = match bean.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(checkback_id = %bean.checkback_id, error = %e,
                    "payload serialization failed, ready record left for resend");
                return;
            }
        };

        match self
            .gateway
            .publish(&route.exchange, &route.route_key, &payload)
            .await
        {
            Ok(()) => {
                if let Err(e) = self.coordinator.del_ready(&bean.checkback_id).await {
                    // Worst case the daemon resends a confirmed message;
                    // idempotent consumers absorb the duplicate.
                    tracing::warn!(checkback_id = %bean.checkback_id, error = %e,
                        "ready delete failed after confirmed publish");
                }
            }
            Err(e) => {
                tracing::warn!(checkback_id = %bean.checkback_id, error = ?e,
                    "publish unconfirmed, ready record kept for reconciliation");
            }
        }
    }
}
