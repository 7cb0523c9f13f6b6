//! # Reconciliation Daemon
//!
//! This module provides [`ReconciliationDaemon`]: the periodic, lock-guarded
//! compensation job that resolves stuck prepare/ready records.
//!
//! The daemon is the only path out of the `PREPARED` and `READY` states when
//! the bridge crashed or the broker never confirmed:
//! - Prepare sweep: checkback miss means the local operation never
//!   completed, so the record is discarded; a hit means the bridge died
//!   before hand-off, so the payload is rebuilt from the business row and
//!   re-published.
//! - Ready sweep: the local commit is already known to have happened, so the
//!   record is re-published unconditionally and deleted only on
//!   confirmation.
//!
//! Each sweep is guarded by its own advisory lock so only one producer
//! replica compensates per period. Duplicate resends caused by lock expiry
//! or a too-frequent sweep are acceptable: consumers are idempotent.

use crate::message::{PrepareRecord, ReadyRecord, TransferBean};
use crate::port::broker::BrokerTransport;
use crate::port::checkback::CheckbackQuery;
use crate::port::coordinator::Coordinator;
use crate::port::lock::{LockError, LockManager, with_lock};
use crate::gateway::BrokerGateway;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Configuration for [`ReconciliationDaemon`].
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Minimum record age before a sweep touches it. Must exceed one normal
    /// bridge round trip or the daemon races the bridge it backstops.
    pub grace: Duration,
    /// TTL of each sweep lock; must exceed the worst-case sweep runtime.
    pub lock_ttl: Duration,
    /// Lock name guarding the prepare sweep.
    pub prepare_lock_name: String,
    /// Lock name guarding the ready sweep.
    pub ready_lock_name: String,
    /// Interval between cycles in [`ReconciliationDaemon::start`].
    pub cycle_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(90),
            prepare_lock_name: "txmq.sweep.prepare".to_string(),
            ready_lock_name: "txmq.sweep.ready".to_string(),
            cycle_interval: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = interval;
        self
    }
}

/// Errors from sweep operations.
///
/// Per-record failures never surface here; they are logged with the
/// checkback id and the sweep continues. Only failures that prevent the
/// sweep itself (lock backend, snapshot read) propagate.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The lock backend failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The coordinator snapshot could not be read.
    #[error("coordinator error: {0}")]
    Coordinator(String),

    /// A compensation publish was not confirmed.
    #[error("compensation publish failed: {0}")]
    Publish(String),
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records old enough to be examined.
    pub scanned: usize,
    /// Prepare records discarded because the local operation never
    /// completed.
    pub discarded: usize,
    /// Records re-published (and deleted on confirmation).
    pub republished: usize,
    /// Records whose compensation failed this cycle; retried next cycle.
    pub failed: usize,
}

/// Outcome of one full cycle. `None` means the sweep was skipped because
/// another replica holds its lock.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub prepare: Option<SweepReport>,
    pub ready: Option<SweepReport>,
}

/// Counters aggregated across cycles.
#[derive(Debug, Default)]
pub struct DaemonMetrics {
    /// Total cycles run.
    pub cycles: AtomicU64,
    /// Prepare records discarded.
    pub prepare_discarded: AtomicU64,
    /// Prepare records re-published.
    pub prepare_republished: AtomicU64,
    /// Ready records re-published.
    pub ready_republished: AtomicU64,
    /// Per-record compensation failures.
    pub record_failures: AtomicU64,
}

impl Clone for DaemonMetrics {
    fn clone(&self) -> Self {
        Self {
            cycles: AtomicU64::new(self.cycles.load(Ordering::SeqCst)),
            prepare_discarded: AtomicU64::new(self.prepare_discarded.load(Ordering::SeqCst)),
            prepare_republished: AtomicU64::new(self.prepare_republished.load(Ordering::SeqCst)),
            ready_republished: AtomicU64::new(self.ready_republished.load(Ordering::SeqCst)),
            record_failures: AtomicU64::new(self.record_failures.load(Ordering::SeqCst)),
        }
    }
}

/// Periodic compensation over the coordinator store.
pub struct ReconciliationDaemon<C, L, B, Q>
where
    C: Coordinator,
    L: LockManager,
    B: BrokerTransport,
    Q: CheckbackQuery,
{
    coordinator: Arc<C>,
    lock: Arc<L>,
    gateway: Arc<BrokerGateway<B>>,
    checkback: Arc<Q>,
    config: DaemonConfig,
    metrics: Arc<DaemonMetrics>,
}

impl<C, L, B, Q> ReconciliationDaemon<C, L, B, Q>
where
    C: Coordinator,
    L: LockManager,
    B: BrokerTransport,
    Q: CheckbackQuery,
{
    /// Create a daemon over the protocol's collaborators.
    pub fn new(
        coordinator: Arc<C>,
        lock: Arc<L>,
        gateway: Arc<BrokerGateway<B>>,
        checkback: Arc<Q>,
        config: DaemonConfig,
    ) -> Self {
        Self {
            coordinator,
            lock,
            gateway,
            checkback,
            config,
            metrics: Arc::new(DaemonMetrics::default()),
        }
    }

    /// Current aggregated counters.
    pub fn metrics(&self) -> DaemonMetrics {
        (*self.metrics).clone()
    }

    /// Run both sweeps once. Sweep-level failures are logged, not fatal;
    /// the next cycle always has another chance.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.metrics.cycles.fetch_add(1, Ordering::SeqCst);

        let prepare = match self.sweep_prepare().await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "prepare sweep failed");
                None
            }
        };

        let ready = match self.sweep_ready().await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "ready sweep failed");
                None
            }
        };

        CycleOutcome { prepare, ready }
    }

    /// Sweep stale prepare records under the prepare lock.
    ///
    /// Returns `Ok(None)` when another replica holds the lock.
    pub async fn sweep_prepare(&self) -> Result<Option<SweepReport>, DaemonError> {
        let outcome = with_lock(
            &*self.lock,
            &self.config.prepare_lock_name,
            self.config.lock_ttl,
            || self.sweep_prepare_locked(),
        )
        .await?;

        match outcome {
            None => Ok(None),
            Some(result) => result.map(Some),
        }
    }

    async fn sweep_prepare_locked(&self) -> Result<SweepReport, DaemonError> {
        let records = self
            .coordinator
            .get_prepare()
            .await
            .map_err(|e| DaemonError::Coordinator(e.to_string()))?;

        let now = Utc::now();
        // An out-of-range grace means "defer forever", never "sweep now".
        let grace = chrono::Duration::from_std(self.config.grace).unwrap_or(chrono::Duration::MAX);
        let mut report = SweepReport::default();

        for record in records {
            if record.age(now) < grace {
                continue;
            }
            report.scanned += 1;

            match self.checkback.fetch(&record.checkback_id).await {
                Ok(None) => {
                    // The local operation never completed; no effect, no
                    // message owed.
                    tracing::info!(checkback_id = %record.checkback_id, biz_id = %record.biz_id,
                        "local operation incomplete, discarding prepare record");
                    match self.coordinator.del_prepare(&record.checkback_id).await {
                        Ok(()) => {
                            report.discarded += 1;
                            self.metrics.prepare_discarded.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            tracing::warn!(checkback_id = %record.checkback_id, error = %e,
                                "prepare discard failed");
                            report.failed += 1;
                            self.metrics.record_failures.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                Ok(Some(data)) => {
                    // The local operation completed but the bridge never
                    // reached the publish hand-off.
                    tracing::info!(checkback_id = %record.checkback_id, biz_id = %record.biz_id,
                        "local operation complete, republishing on behalf of crashed bridge");
                    match self.compensate_prepare(&record, data).await {
                        Ok(()) => {
                            report.republished += 1;
                            self.metrics
                                .prepare_republished
                                .fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            tracing::warn!(checkback_id = %record.checkback_id, error = %e,
                                "prepare compensation failed, retrying next cycle");
                            report.failed += 1;
                            self.metrics.record_failures.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(checkback_id = %record.checkback_id, error = %e,
                        "checkback query failed, record kept");
                    report.failed += 1;
                    self.metrics.record_failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        Ok(report)
    }

    /// Sweep stale ready records under the ready lock.
    ///
    /// Returns `Ok(None)` when another replica holds the lock.
    pub async fn sweep_ready(&self) -> Result<Option<SweepReport>, DaemonError> {
        let outcome = with_lock(
            &*self.lock,
            &self.config.ready_lock_name,
            self.config.lock_ttl,
            || self.sweep_ready_locked(),
        )
        .await?;

        match outcome {
            None => Ok(None),
            Some(result) => result.map(Some),
        }
    }

    async fn sweep_ready_locked(&self) -> Result<SweepReport, DaemonError> {
        let records = self
            .coordinator
            .get_ready()
            .await
            .map_err(|e| DaemonError::Coordinator(e.to_string()))?;

        let now = Utc::now();
        // An out-of-range grace means "defer forever", never "sweep now".
        let grace = chrono::Duration::from_std(self.config.grace).unwrap_or(chrono::Duration::MAX);
        let mut report = SweepReport::default();

        for record in records {
            if record.age(now) < grace {
                continue;
            }
            report.scanned += 1;

            match self.compensate_ready(&record).await {
                Ok(()) => {
                    tracing::info!(checkback_id = %record.checkback_id, biz_id = %record.biz_id,
                        "ready record republished");
                    report.republished += 1;
                    self.metrics.ready_republished.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    tracing::warn!(checkback_id = %record.checkback_id, error = %e,
                        "ready resend failed, record kept for next cycle");
                    report.failed += 1;
                    self.metrics.record_failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        Ok(report)
    }

    /// Re-publish on behalf of a crashed bridge and delete the prepare
    /// record.
    ///
    /// The prepare record has no payload of its own; `data` is the transfer
    /// data rebuilt from the durable business row found by the checkback
    /// query.
    pub async fn compensate_prepare(
        &self,
        record: &PrepareRecord,
        data: serde_json::Value,
    ) -> Result<(), DaemonError> {
        let bean = TransferBean::new(record.checkback_id.clone(), data);
        self.publish_bean(&record.exchange, &record.route_key, &bean)
            .await?;

        self.coordinator
            .del_prepare(&record.checkback_id)
            .await
            .map_err(|e| DaemonError::Coordinator(e.to_string()))
    }

    /// Re-publish a ready record and delete it only on confirmation.
    pub async fn compensate_ready(&self, record: &ReadyRecord) -> Result<(), DaemonError> {
        let bean = record.to_bean();
        self.publish_bean(&record.exchange, &record.route_key, &bean)
            .await?;

        self.coordinator
            .del_ready(&record.checkback_id)
            .await
            .map_err(|e| DaemonError::Coordinator(e.to_string()))
    }

    async fn publish_bean(
        &self,
        exchange: &str,
        route_key: &str,
        bean: &TransferBean,
    ) -> Result<(), DaemonError> {
        let payload = bean
            .to_bytes()
            .map_err(|e| DaemonError::Publish(e.to_string()))?;

        self.gateway
            .publish(exchange, route_key, &payload)
            .await
            .map_err(|e| DaemonError::Publish(format!("{e:?}")))
    }

    /// Run cycles on a fixed period until `shutdown` fires.
    ///
    /// The sweeps themselves carry no timer state; external schedulers may
    /// call [`ReconciliationDaemon::run_cycle`] directly instead.
    pub async fn start(&self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("reconciliation daemon stopping");
                    return;
                }
                _ = tokio::time::sleep(self.config.cycle_interval) => {
                    let outcome = self.run_cycle().await;
                    tracing::debug!(?outcome, "reconciliation cycle finished");
                }
            }
        }
    }
}
