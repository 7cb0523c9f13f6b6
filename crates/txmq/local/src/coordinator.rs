//! In-memory [`Coordinator`] backed by plain hash maps.
//!
//! State does not survive process restart, so this adapter is for tests and
//! single-process demos only; durable deployments use `txmq-sqlite`.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use txmq_core::message::{CheckbackId, PrepareRecord, ReadyRecord};
use txmq_core::port::coordinator::Coordinator;

/// Error type for the in-memory coordinator. No operation can actually
/// fail, so this enum has no variants.
#[derive(Debug, Error)]
pub enum InMemoryCoordinatorError {}

#[derive(Default)]
struct CoordinatorState {
    prepare: HashMap<CheckbackId, PrepareRecord>,
    ready: HashMap<CheckbackId, ReadyRecord>,
    applied: HashSet<CheckbackId>,
}

/// Infallible in-process coordinator store.
#[derive(Clone, Default)]
pub struct InMemoryCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
}

impl InMemoryCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of prepare records currently held.
    pub async fn prepare_len(&self) -> usize {
        self.state.lock().await.prepare.len()
    }

    /// Number of ready records currently held.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    type Error = InMemoryCoordinatorError;

    async fn put_prepare(&self, record: PrepareRecord) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.prepare.insert(record.checkback_id.clone(), record);
        Ok(())
    }

    async fn get_prepare(&self) -> Result<Vec<PrepareRecord>, Self::Error> {
        let state = self.state.lock().await;
        Ok(state.prepare.values().cloned().collect())
    }

    async fn del_prepare(&self, checkback_id: &CheckbackId) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.prepare.remove(checkback_id);
        Ok(())
    }

    async fn put_ready(&self, record: ReadyRecord) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.ready.insert(record.checkback_id.clone(), record);
        Ok(())
    }

    async fn get_ready(&self) -> Result<Vec<ReadyRecord>, Self::Error> {
        let state = self.state.lock().await;
        Ok(state.ready.values().cloned().collect())
    }

    async fn del_ready(&self, checkback_id: &CheckbackId) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.ready.remove(checkback_id);
        Ok(())
    }

    async fn try_mark_applied(&self, checkback_id: &CheckbackId) -> Result<bool, Self::Error> {
        let mut state = self.state.lock().await;
        Ok(state.applied.insert(checkback_id.clone()))
    }
}
