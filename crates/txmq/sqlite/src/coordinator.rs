//! # SQLite Coordinator
//!
//! This module provides [`SqliteCoordinator`], a durable [`Coordinator`]
//! over a SQLite database:
//!
//! - `txmq_prepare` and `txmq_ready` hold the in-flight protocol records
//! - `txmq_applied` holds the consumer-side idempotency markers
//!
//! Writes use `INSERT OR REPLACE`, deletes tolerate absent keys, and the
//! applied marker relies on `INSERT OR IGNORE` against the primary key for
//! its set-if-absent semantics. The schema is created on first connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use txmq_core::message::{CheckbackId, PrepareRecord, ReadyRecord};
use txmq_core::port::coordinator::Coordinator;

/// Durable coordinator store backed by SQLite.
#[derive(Clone)]
pub struct SqliteCoordinator {
    pool: SqlitePool,
}

impl SqliteCoordinator {
    /// Connect to a database URL (e.g. `sqlite:///var/lib/txmq/coord.db`),
    /// creating the file and schema as needed.
    pub async fn new(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory database.
    ///
    /// Pinned to a single connection: each `sqlite::memory:` connection is
    /// its own database, so a larger pool would scatter the tables.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool, creating the schema as needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// The underlying pool, for sharing with [`SqliteLockManager`].
    ///
    /// [`SqliteLockManager`]: crate::lock::SqliteLockManager
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txmq_prepare (
                checkback_id TEXT PRIMARY KEY,
                biz_id       TEXT NOT NULL,
                exchange     TEXT NOT NULL,
                route_key    TEXT NOT NULL,
                created_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txmq_ready (
                checkback_id TEXT PRIMARY KEY,
                biz_id       TEXT NOT NULL,
                exchange     TEXT NOT NULL,
                route_key    TEXT NOT NULL,
                payload      TEXT NOT NULL,
                created_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txmq_applied (
                checkback_id TEXT PRIMARY KEY,
                applied_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::debug!("coordinator schema ready");
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct PrepareRow {
    checkback_id: String,
    biz_id: String,
    exchange: String,
    route_key: String,
    created_at: DateTime<Utc>,
}

impl From<PrepareRow> for PrepareRecord {
    fn from(row: PrepareRow) -> Self {
        Self {
            checkback_id: CheckbackId::new(row.checkback_id),
            biz_id: row.biz_id,
            exchange: row.exchange,
            route_key: row.route_key,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReadyRow {
    checkback_id: String,
    biz_id: String,
    exchange: String,
    route_key: String,
    payload: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ReadyRow> for ReadyRecord {
    type Error = sqlx::Error;

    fn try_from(row: ReadyRow) -> Result<Self, sqlx::Error> {
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Self {
            checkback_id: CheckbackId::new(row.checkback_id),
            biz_id: row.biz_id,
            exchange: row.exchange,
            route_key: row.route_key,
            payload,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl Coordinator for SqliteCoordinator {
    type Error = sqlx::Error;

    async fn put_prepare(&self, record: PrepareRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO txmq_prepare
                (checkback_id, biz_id, exchange, route_key, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(record.checkback_id.as_str())
        .bind(&record.biz_id)
        .bind(&record.exchange)
        .bind(&record.route_key)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_prepare(&self) -> Result<Vec<PrepareRecord>, sqlx::Error> {
        let rows: Vec<PrepareRow> = sqlx::query_as(
            "SELECT checkback_id, biz_id, exchange, route_key, created_at \
             FROM txmq_prepare ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PrepareRecord::from).collect())
    }

    async fn del_prepare(&self, checkback_id: &CheckbackId) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM txmq_prepare WHERE checkback_id = ?1")
            .bind(checkback_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_ready(&self, record: ReadyRecord) -> Result<(), sqlx::Error> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO txmq_ready
                (checkback_id, biz_id, exchange, route_key, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(record.checkback_id.as_str())
        .bind(&record.biz_id)
        .bind(&record.exchange)
        .bind(&record.route_key)
        .bind(payload)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ready(&self) -> Result<Vec<ReadyRecord>, sqlx::Error> {
        let rows: Vec<ReadyRow> = sqlx::query_as(
            "SELECT checkback_id, biz_id, exchange, route_key, payload, created_at \
             FROM txmq_ready ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ReadyRecord::try_from).collect()
    }

    async fn del_ready(&self, checkback_id: &CheckbackId) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM txmq_ready WHERE checkback_id = ?1")
            .bind(checkback_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_mark_applied(&self, checkback_id: &CheckbackId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO txmq_applied (checkback_id, applied_at) VALUES (?1, ?2)",
        )
        .bind(checkback_id.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use txmq_core::message::{MessageRoute, TransferBean};

    fn route() -> MessageRoute {
        MessageRoute::new("route_config", "route_config_key", "route_config")
    }

    #[tokio::test]
    async fn prepare_records_round_trip() {
        let store = SqliteCoordinator::in_memory().await.unwrap();
        let id = CheckbackId::new("1001");

        store
            .put_prepare(PrepareRecord::new(id.clone(), &route()))
            .await
            .unwrap();

        let records = store.get_prepare().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].checkback_id, id);
        assert_eq!(records[0].exchange, "route_config");
        assert_eq!(records[0].route_key, "route_config_key");

        store.del_prepare(&id).await.unwrap();
        assert!(store.get_prepare().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_prepare_overwrites_same_key() {
        let store = SqliteCoordinator::in_memory().await.unwrap();
        let id = CheckbackId::new("dup");

        store
            .put_prepare(PrepareRecord::new(id.clone(), &route()))
            .await
            .unwrap();
        store
            .put_prepare(PrepareRecord::new(id, &route()))
            .await
            .unwrap();

        assert_eq!(store.get_prepare().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ready_records_preserve_payload() {
        let store = SqliteCoordinator::in_memory().await.unwrap();
        let bean = TransferBean::new(
            CheckbackId::new("1002"),
            json!({"path": "/gateway/v2", "nested": {"n": 7}}),
        );

        store
            .put_ready(ReadyRecord::new(&route(), &bean))
            .await
            .unwrap();

        let records = store.get_ready().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].to_bean(), bean);

        store.del_ready(&bean.checkback_id).await.unwrap();
        assert!(store.get_ready().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_of_absent_key_is_noop() {
        let store = SqliteCoordinator::in_memory().await.unwrap();
        store.del_prepare(&CheckbackId::new("missing")).await.unwrap();
        store.del_ready(&CheckbackId::new("missing")).await.unwrap();
    }

    #[tokio::test]
    async fn mark_applied_wins_exactly_once() {
        let store = SqliteCoordinator::in_memory().await.unwrap();
        let id = CheckbackId::new("once");

        assert!(store.try_mark_applied(&id).await.unwrap());
        assert!(!store.try_mark_applied(&id).await.unwrap());
        assert!(store.try_mark_applied(&CheckbackId::new("other")).await.unwrap());
    }

    #[tokio::test]
    async fn records_survive_pool_reopen() {
        let path = std::env::temp_dir().join(format!("txmq-coord-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}", path.display());

        {
            let store = SqliteCoordinator::new(&url).await.unwrap();
            store
                .put_prepare(PrepareRecord::new(CheckbackId::new("crash"), &route()))
                .await
                .unwrap();
            store
                .put_ready(ReadyRecord::new(
                    &route(),
                    &TransferBean::new(CheckbackId::new("crash"), json!({"path": "/x"})),
                ))
                .await
                .unwrap();
            store.close().await;
        }

        let store = SqliteCoordinator::new(&url).await.unwrap();
        assert_eq!(store.get_prepare().await.unwrap().len(), 1);
        assert_eq!(store.get_ready().await.unwrap().len(), 1);
        store.close().await;

        std::fs::remove_file(&path).ok();
    }
}
