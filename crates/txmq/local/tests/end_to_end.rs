//! End-to-end lifecycle tests over the in-process adapters: the bridge, the
//! gateway dispatch path, the reconciliation daemon, and the dead-letter
//! compensation loop, wired together the way a producer and consumer pair
//! would be in production.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use txmq_core::bridge::PublishCommitBridge;
use txmq_core::daemon::{DaemonConfig, ReconciliationDaemon};
use txmq_core::gateway::{dead_letter_exchange, dead_letter_queue, BrokerGateway, GatewayConfig, DEAD_LETTER_ROUTE_KEY};
use txmq_core::message::{CheckbackId, MessageRoute, PrepareRecord, ReadyRecord, TransferBean};
use txmq_core::port::checkback::{CheckbackError, CheckbackQuery};
use txmq_core::port::coordinator::Coordinator;
use txmq_core::port::lock::LockManager;
use txmq_core::processor::{decode_bean, DeliveryMode, Processor, ProcessorError};
use txmq_local::{InMemoryBroker, InMemoryCoordinator, InMemoryLockManager};

const EXCHANGE: &str = "route_config";
const ROUTE_KEY: &str = "route_config_key";
const QUEUE: &str = "route_config";
const BIZ_ID: &str = "route_config";

fn route() -> MessageRoute {
    MessageRoute::new(EXCHANGE, ROUTE_KEY, BIZ_ID)
}

/// The producer's business table. Rows written here are what the checkback
/// query inspects during prepare reconciliation.
#[derive(Default)]
struct RouteConfigTable {
    rows: Mutex<HashMap<String, Value>>,
}

impl RouteConfigTable {
    fn insert(&self, id: &str, row: Value) {
        self.rows.lock().unwrap().insert(id.to_string(), row);
    }

    fn remove(&self, id: &str) {
        self.rows.lock().unwrap().remove(id);
    }

    fn contains(&self, id: &str) -> bool {
        self.rows.lock().unwrap().contains_key(id)
    }
}

#[async_trait]
impl CheckbackQuery for RouteConfigTable {
    async fn fetch(&self, checkback_id: &CheckbackId) -> Result<Option<Value>, CheckbackError> {
        Ok(self.rows.lock().unwrap().get(checkback_id.as_str()).cloned())
    }
}

/// Downstream consumer: marks the checkback id applied before mutating its
/// own table, so redelivered duplicates are acknowledged without effect.
struct ApplyProcessor {
    markers: Arc<InMemoryCoordinator>,
    applied: Mutex<HashMap<String, Value>>,
    applications: AtomicUsize,
}

impl ApplyProcessor {
    fn new(markers: Arc<InMemoryCoordinator>) -> Self {
        Self {
            markers,
            applied: Mutex::new(HashMap::new()),
            applications: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Processor for ApplyProcessor {
    async fn process(&self, delivery: &txmq_core::port::broker::Delivery) -> Result<(), ProcessorError> {
        let bean = decode_bean(delivery)?;
        let first = self
            .markers
            .try_mark_applied(&bean.checkback_id)
            .await
            .map_err(|e| ProcessorError::failed(e.to_string()))?;
        if !first {
            return Ok(());
        }
        self.applied
            .lock()
            .unwrap()
            .insert(bean.checkback_id.0.clone(), bean.data);
        self.applications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Consumer that never succeeds, driving deliveries into the dead-letter
/// queue.
struct PoisonProcessor;

#[async_trait]
impl Processor for PoisonProcessor {
    async fn process(&self, _delivery: &txmq_core::port::broker::Delivery) -> Result<(), ProcessorError> {
        Err(ProcessorError::failed("downstream rejects this payload"))
    }
}

/// Dead-letter recovery handler: compensates by removing the producer's
/// business row.
struct RollbackProcessor {
    table: Arc<RouteConfigTable>,
    compensated: AtomicUsize,
}

#[async_trait]
impl Processor for RollbackProcessor {
    async fn process(&self, delivery: &txmq_core::port::broker::Delivery) -> Result<(), ProcessorError> {
        let bean = decode_bean(delivery)?;
        self.table.remove(bean.checkback_id.as_str());
        self.compensated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    broker: Arc<InMemoryBroker>,
    gateway: Arc<BrokerGateway<InMemoryBroker>>,
    coordinator: Arc<InMemoryCoordinator>,
    table: Arc<RouteConfigTable>,
    bridge: PublishCommitBridge<InMemoryCoordinator, InMemoryBroker>,
}

impl Harness {
    fn new() -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let gateway = Arc::new(BrokerGateway::with_config(
            broker.clone(),
            GatewayConfig::default().with_max_deliver(3),
        ));
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let bridge = PublishCommitBridge::new(coordinator.clone(), gateway.clone());
        Self {
            broker,
            gateway,
            coordinator,
            table: Arc::new(RouteConfigTable::default()),
            bridge,
        }
    }

    fn daemon(
        &self,
        lock: Arc<InMemoryLockManager>,
    ) -> ReconciliationDaemon<InMemoryCoordinator, InMemoryLockManager, InMemoryBroker, RouteConfigTable>
    {
        ReconciliationDaemon::new(
            self.coordinator.clone(),
            lock,
            self.gateway.clone(),
            self.table.clone(),
            DaemonConfig::default().with_grace(Duration::ZERO),
        )
    }

    /// Run the bridge for one business insert and return the bean.
    async fn transfer(&self, id: &str, row: Value) -> TransferBean {
        let table = self.table.clone();
        let id_owned = id.to_string();
        let row_clone = row.clone();
        self.bridge
            .execute(&route(), CheckbackId::new(id), move || async move {
                table.insert(&id_owned, row_clone.clone());
                Ok::<_, std::io::Error>(TransferBean::new(CheckbackId::new(id_owned.clone()), row_clone))
            })
            .await
            .expect("bridge execute")
    }

    /// Dispatch a queue until it runs dry.
    async fn drain(&self, queue: &str) {
        loop {
            let report = self.gateway.dispatch_once(queue).await.expect("dispatch");
            if report.fetched == 0 {
                return;
            }
        }
    }
}

#[tokio::test]
async fn happy_path_applies_downstream_and_clears_protocol_state() {
    let harness = Harness::new();
    let markers = Arc::new(InMemoryCoordinator::new());
    let consumer = Arc::new(ApplyProcessor::new(markers));

    harness
        .gateway
        .add_dlx(
            QUEUE,
            EXCHANGE,
            ROUTE_KEY,
            consumer.clone(),
            DeliveryMode::Distributed,
            &dead_letter_exchange(BIZ_ID),
            DEAD_LETTER_ROUTE_KEY,
        )
        .await
        .unwrap();

    let bean = harness.transfer("1001", json!({"path": "/gateway/v1"})).await;
    assert_eq!(bean.checkback_id.as_str(), "1001");

    // The confirmed publish cleared both records synchronously.
    assert_eq!(harness.coordinator.prepare_len().await, 0);
    assert_eq!(harness.coordinator.ready_len().await, 0);

    harness.drain(QUEUE).await;

    let applied = consumer.applied.lock().unwrap();
    assert_eq!(applied["1001"]["path"], "/gateway/v1");
    assert_eq!(consumer.applications.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unconfirmed_publish_is_resent_by_daemon_and_applied_once() {
    let harness = Harness::new();
    let markers = Arc::new(InMemoryCoordinator::new());
    let consumer = Arc::new(ApplyProcessor::new(markers));
    harness
        .gateway
        .add(QUEUE, EXCHANGE, ROUTE_KEY, consumer.clone(), DeliveryMode::Distributed)
        .await
        .unwrap();

    // The broker refuses to confirm the bridge's publish; the caller still
    // sees success and the ready record survives.
    harness.broker.fail_next_publishes(1).await;
    let bean = harness.transfer("1002", json!({"path": "/gateway/v2"})).await;
    assert_eq!(harness.coordinator.ready_len().await, 1);
    assert_eq!(harness.broker.queue_depth(QUEUE).await, 0);

    // The daemon resends and clears the record on confirmation.
    let daemon = harness.daemon(Arc::new(InMemoryLockManager::new()));
    let outcome = daemon.run_cycle().await;
    assert_eq!(outcome.ready.unwrap().republished, 1);
    assert_eq!(harness.coordinator.ready_len().await, 0);

    harness.drain(QUEUE).await;
    assert_eq!(consumer.applications.load(Ordering::SeqCst), 1);

    // An over-eager second resend of the same bean is absorbed by the
    // consumer-side applied marker.
    let payload = bean.to_bytes().unwrap();
    harness.gateway.publish(EXCHANGE, ROUTE_KEY, &payload).await.unwrap();
    harness.drain(QUEUE).await;

    assert_eq!(consumer.applications.load(Ordering::SeqCst), 1);
    assert_eq!(harness.broker.queue_depth(QUEUE).await, 0);
}

#[tokio::test]
async fn crashed_bridge_prepare_records_reconcile_both_ways() {
    let harness = Harness::new();
    let markers = Arc::new(InMemoryCoordinator::new());
    let consumer = Arc::new(ApplyProcessor::new(markers));
    harness
        .gateway
        .add(QUEUE, EXCHANGE, ROUTE_KEY, consumer.clone(), DeliveryMode::Distributed)
        .await
        .unwrap();

    // Simulate two bridge crashes after put_prepare: one where the local
    // transaction had committed, one where it had not.
    harness.table.insert("2001", json!({"path": "/committed"}));
    harness
        .coordinator
        .put_prepare(PrepareRecord::new(CheckbackId::new("2001"), &route()))
        .await
        .unwrap();
    harness
        .coordinator
        .put_prepare(PrepareRecord::new(CheckbackId::new("2002"), &route()))
        .await
        .unwrap();

    let daemon = harness.daemon(Arc::new(InMemoryLockManager::new()));
    let report = daemon.sweep_prepare().await.unwrap().unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.republished, 1);
    assert_eq!(report.discarded, 1);
    assert_eq!(harness.coordinator.prepare_len().await, 0);

    // Only the committed transfer reaches the consumer.
    harness.drain(QUEUE).await;
    let applied = consumer.applied.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied["2001"]["path"], "/committed");
}

#[tokio::test]
async fn dual_record_crash_state_converges_exactly_once() {
    let harness = Harness::new();
    let markers = Arc::new(InMemoryCoordinator::new());
    let consumer = Arc::new(ApplyProcessor::new(markers));
    harness
        .gateway
        .add(QUEUE, EXCHANGE, ROUTE_KEY, consumer.clone(), DeliveryMode::Distributed)
        .await
        .unwrap();

    // Crash between put_ready and del_prepare: the business row committed
    // and both protocol records persist for the same transfer.
    harness.table.insert("6001", json!({"path": "/dual"}));
    harness
        .coordinator
        .put_prepare(PrepareRecord::new(CheckbackId::new("6001"), &route()))
        .await
        .unwrap();
    harness
        .coordinator
        .put_ready(ReadyRecord::new(
            &route(),
            &TransferBean::new(CheckbackId::new("6001"), json!({"path": "/dual"})),
        ))
        .await
        .unwrap();

    let daemon = harness.daemon(Arc::new(InMemoryLockManager::new()));
    let outcome = daemon.run_cycle().await;

    // Each sweep resolves its own record, so the transfer goes out twice.
    assert_eq!(outcome.prepare.unwrap().republished, 1);
    assert_eq!(outcome.ready.unwrap().republished, 1);
    assert_eq!(harness.coordinator.prepare_len().await, 0);
    assert_eq!(harness.coordinator.ready_len().await, 0);

    // The consumer-side applied marker collapses both deliveries into one
    // business effect.
    harness.drain(QUEUE).await;
    let applied = consumer.applied.lock().unwrap();
    assert_eq!(applied["6001"]["path"], "/dual");
    assert_eq!(consumer.applications.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn poisoned_delivery_dead_letters_then_compensates_producer() {
    let harness = Harness::new();
    let dlx = dead_letter_exchange(BIZ_ID);
    let dlq = dead_letter_queue(BIZ_ID);

    harness
        .gateway
        .add_dlx(
            QUEUE,
            EXCHANGE,
            ROUTE_KEY,
            Arc::new(PoisonProcessor),
            DeliveryMode::Distributed,
            &dlx,
            DEAD_LETTER_ROUTE_KEY,
        )
        .await
        .unwrap();
    let rollback = Arc::new(RollbackProcessor {
        table: harness.table.clone(),
        compensated: AtomicUsize::new(0),
    });
    harness
        .gateway
        .add(&dlq, &dlx, DEAD_LETTER_ROUTE_KEY, rollback.clone(), DeliveryMode::DeadLetter)
        .await
        .unwrap();

    harness.transfer("3001", json!({"path": "/doomed"})).await;
    assert!(harness.table.contains("3001"));

    // Three failed attempts exhaust the retry budget, the fourth fetch
    // finds nothing on the business queue.
    harness.drain(QUEUE).await;
    assert_eq!(harness.broker.queue_depth(QUEUE).await, 0);
    assert_eq!(harness.broker.queue_depth(&dlq).await, 1);

    // The recovery handler undoes the producer's row.
    harness.drain(&dlq).await;
    assert!(!harness.table.contains("3001"));
    assert_eq!(rollback.compensated.load(Ordering::SeqCst), 1);
    assert_eq!(harness.broker.queue_depth(&dlq).await, 0);
}

#[tokio::test]
async fn sweep_lock_excludes_concurrent_replicas() {
    let harness = Harness::new();
    harness
        .coordinator
        .put_prepare(PrepareRecord::new(CheckbackId::new("4001"), &route()))
        .await
        .unwrap();

    let lock = Arc::new(InMemoryLockManager::new());
    let daemon = harness.daemon(lock.clone());
    let config = DaemonConfig::default();

    // Another replica holds the prepare sweep lock.
    let token = lock
        .try_acquire(&config.prepare_lock_name, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    assert!(daemon.sweep_prepare().await.unwrap().is_none());
    assert_eq!(harness.coordinator.prepare_len().await, 1);

    // Once released, the sweep proceeds (checkback miss, so discard).
    lock.release(&config.prepare_lock_name, &token).await.unwrap();
    let report = daemon.sweep_prepare().await.unwrap().unwrap();
    assert_eq!(report.discarded, 1);
    assert_eq!(harness.coordinator.prepare_len().await, 0);
}

#[tokio::test]
async fn background_loops_deliver_without_manual_dispatch() {
    let harness = Harness::new();
    let markers = Arc::new(InMemoryCoordinator::new());
    let consumer = Arc::new(ApplyProcessor::new(markers));
    harness
        .gateway
        .add(QUEUE, EXCHANGE, ROUTE_KEY, consumer.clone(), DeliveryMode::Distributed)
        .await
        .unwrap();

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let gateway = harness.gateway.clone();
    let rx = shutdown_tx.subscribe();
    let dispatcher = tokio::spawn(async move { gateway.start(rx).await });

    harness.transfer("5001", json!({"path": "/bg"})).await;

    // Wait for the polling loop to pick the delivery up.
    for _ in 0..50 {
        if consumer.applications.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(consumer.applications.load(Ordering::SeqCst), 1);

    shutdown_tx.send(()).unwrap();
    dispatcher.await.unwrap();
}
