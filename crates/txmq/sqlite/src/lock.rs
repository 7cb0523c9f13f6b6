//! # SQLite Lock Manager
//!
//! Advisory expiring lock over a `txmq_lock` table. Acquisition is a single
//! upsert whose `WHERE` clause only lets an expired holder be displaced, so
//! the check-and-set is atomic at the statement level and works across
//! producer replicas sharing the database.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use txmq_core::port::lock::{LockError, LockManager, LockToken};

/// Expiring named lock backed by SQLite.
#[derive(Clone)]
pub struct SqliteLockManager {
    pool: SqlitePool,
}

impl SqliteLockManager {
    /// Connect to a database URL, creating the file and schema as needed.
    pub async fn new(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool (typically shared with the coordinator),
    /// creating the schema as needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        let manager = Self { pool };
        manager.migrate().await?;
        Ok(manager)
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS txmq_lock (
                name       TEXT PRIMARY KEY,
                token      TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockManager for SqliteLockManager {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let token = LockToken::generate();
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;

        // The upsert only fires when the current holder's lease has lapsed;
        // a live holder leaves rows_affected at zero.
        let result = sqlx::query(
            r#"
            INSERT INTO txmq_lock (name, token, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE
                SET token = excluded.token, expires_at = excluded.expires_at
                WHERE txmq_lock.expires_at <= ?4
            "#,
        )
        .bind(name)
        .bind(&token.0)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;

        if result.rows_affected() == 1 {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, name: &str, token: &LockToken) -> Result<(), LockError> {
        sqlx::query("DELETE FROM txmq_lock WHERE name = ?1 AND token = ?2")
            .bind(name)
            .bind(&token.0)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(())
    }
}
