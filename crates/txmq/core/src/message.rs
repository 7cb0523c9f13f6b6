//! # Protocol Messages
//!
//! Data model for the prepare/ready message lifecycle.
//!
//! A logical transfer moves through
//! `NONE → PREPARED → (rolled back → deleted)` or
//! `(LOCAL_COMMITTED → READY → CONFIRMED → deleted)`. The records defined
//! here are the durable markers for the `PREPARED` and `READY` states; the
//! reconciliation daemon provides the only exit from either state when the
//! natural transition never happens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique key correlating a local business record to its in-flight
/// cross-service message.
///
/// The producer uses it to verify local completion during reconciliation;
/// the consumer uses it as the idempotency key. Callers may supply their own
/// (a primary key, an order number) or generate one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckbackId(pub String);

impl CheckbackId {
    /// Create a checkback id from a caller-supplied key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random checkback id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// String form of the id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CheckbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CheckbackId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Routing chosen by the caller for one logical transfer: where the message
/// goes and which business grouping it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRoute {
    /// Exchange to publish to.
    pub exchange: String,
    /// Routing key within the exchange.
    pub route_key: String,
    /// Logical business/topic grouping.
    pub biz_id: String,
}

impl MessageRoute {
    /// Create a new route.
    pub fn new(
        exchange: impl Into<String>,
        route_key: impl Into<String>,
        biz_id: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            route_key: route_key.into(),
            biz_id: biz_id.into(),
        }
    }
}

/// Marker that a business operation requiring downstream notification has
/// started but has not yet been confirmed both completed and published.
///
/// Written by the bridge immediately before the guarded business call runs.
/// Deleted either by the bridge once the ready record replaces it, or by the
/// daemon once it determines the local operation never completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRecord {
    /// Correlation key for the checkback query.
    pub checkback_id: CheckbackId,
    /// Logical business/topic grouping.
    pub biz_id: String,
    /// Exchange to publish to if the daemon must resend.
    pub exchange: String,
    /// Routing key to publish with if the daemon must resend.
    pub route_key: String,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

impl PrepareRecord {
    /// Create a prepare record for a route.
    pub fn new(checkback_id: CheckbackId, route: &MessageRoute) -> Self {
        Self {
            checkback_id,
            biz_id: route.biz_id.clone(),
            exchange: route.exchange.clone(),
            route_key: route.route_key.clone(),
            created_at: Utc::now(),
        }
    }

    /// Age of the record relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Marker that the local operation committed and the message must still be
/// confirmed delivered to the broker.
///
/// Written by the bridge immediately after the local commit, before the
/// publish attempt. Deleted only upon a confirmed publish acknowledgment;
/// otherwise left for the daemon to resend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyRecord {
    /// Correlation key for the transfer.
    pub checkback_id: CheckbackId,
    /// Logical business/topic grouping.
    pub biz_id: String,
    /// Exchange to publish to.
    pub exchange: String,
    /// Routing key to publish with.
    pub route_key: String,
    /// Opaque transfer data, carried unmodified to the consumer.
    pub payload: serde_json::Value,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

impl ReadyRecord {
    /// Create a ready record from the committed operation's transfer bean.
    pub fn new(route: &MessageRoute, bean: &TransferBean) -> Self {
        Self {
            checkback_id: bean.checkback_id.clone(),
            biz_id: route.biz_id.clone(),
            exchange: route.exchange.clone(),
            route_key: route.route_key.clone(),
            payload: bean.data.clone(),
            created_at: Utc::now(),
        }
    }

    /// Rebuild the wire payload for a resend.
    pub fn to_bean(&self) -> TransferBean {
        TransferBean {
            checkback_id: self.checkback_id.clone(),
            data: self.payload.clone(),
        }
    }

    /// Age of the record relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// The wire payload: a checkback id plus opaque business data.
///
/// The protocol layer carries `data` unmodified from producer to consumer
/// and never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBean {
    /// Correlation and consumer-idempotency key.
    pub checkback_id: CheckbackId,
    /// Opaque business data.
    pub data: serde_json::Value,
}

impl TransferBean {
    /// Create a transfer bean.
    pub fn new(checkback_id: CheckbackId, data: serde_json::Value) -> Self {
        Self { checkback_id, data }
    }

    /// Serialize to the JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the JSON wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
