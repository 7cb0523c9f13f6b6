//! # Distributed Lock Port
//!
//! Mutual-exclusion primitive over the coordinator's backing store, used to
//! serialize reconciliation sweeps across producer replicas.
//!
//! The lock is purely advisory: it avoids redundant duplicate compensation
//! work, it does not protect correctness. Every coordinator operation is
//! individually idempotent, so a lost or expired lock at worst causes an
//! extra resend that idempotent consumers absorb.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Opaque ownership token handed out on acquisition and required to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

impl LockToken {
    /// Generate a fresh owner token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from lock operations.
///
/// Contention is not an error; [`LockManager::try_acquire`] reports it as
/// `Ok(None)`.
#[derive(Debug, Error)]
pub enum LockError {
    /// Backing store failure.
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Named expiring lock with atomic check-and-set acquisition.
///
/// Invariant: at most one unexpired holder per name at any time. The TTL
/// must exceed the worst-case runtime of the guarded action; expiry
/// guarantees forward progress when a holder crashes without releasing.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Attempt to acquire `name` for `ttl`.
    ///
    /// Returns `Ok(Some(token))` when this caller is now the holder and
    /// `Ok(None)` when another unexpired holder exists.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, LockError>;

    /// Release `name` if `token` still owns it.
    ///
    /// Releasing with a stale token (the lock expired and was reclaimed) is
    /// a no-op.
    async fn release(&self, name: &str, token: &LockToken) -> Result<(), LockError>;
}

/// Run `action` under the named lock, or skip it entirely on contention.
///
/// The lock is released after `action` finishes, including when `action`
/// returns an error. Returns `Ok(None)` when another holder is already
/// processing.
pub async fn with_lock<L, F, Fut, T, E>(
    manager: &L,
    name: &str,
    ttl: Duration,
    action: F,
) -> Result<Option<Result<T, E>>, LockError>
where
    L: LockManager + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let Some(token) = manager.try_acquire(name, ttl).await? else {
        tracing::debug!(lock = name, "lock held elsewhere, skipping");
        return Ok(None);
    };

    let result = action().await;

    if let Err(e) = manager.release(name, &token).await {
        // The entry expires on its own; the next acquirer is not blocked.
        tracing::warn!(lock = name, error = %e, "lock release failed");
    }

    Ok(Some(result))
}
