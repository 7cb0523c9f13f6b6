//! In-memory [`LockManager`] with TTL expiry and token-checked release.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use txmq_core::port::lock::{LockError, LockManager, LockToken};

struct Holder {
    token: LockToken,
    expires_at: Instant,
}

/// Single-process advisory lock table.
///
/// Acquisition is atomic under the table mutex; an expired holder is
/// reclaimed by the next acquirer without any background sweeper.
#[derive(Clone, Default)]
pub struct InMemoryLockManager {
    locks: Arc<Mutex<HashMap<String, Holder>>>,
}

impl InMemoryLockManager {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        if let Some(holder) = locks.get(name) {
            if holder.expires_at > now {
                return Ok(None);
            }
        }

        let token = LockToken::generate();
        locks.insert(
            name.to_string(),
            Holder {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, name: &str, token: &LockToken) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        // Only the current owner may release; a stale token means the lock
        // expired and was reclaimed, which is a no-op.
        if locks.get(name).is_some_and(|h| &h.token == token) {
            locks.remove(name);
        }
        Ok(())
    }
}
