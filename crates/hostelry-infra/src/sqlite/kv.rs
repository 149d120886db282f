//! SQLite key-value store with per-entry expiry.
//!
//! Implements `KvStore` from `hostelry-core`. Values are stored as JSON text;
//! `expires_at` is Unix milliseconds, and expired rows are filtered out on
//! read until `purge_expired` deletes them.

use std::time::Duration;

use chrono::Utc;
use hostelry_core::storage::kv_store::KvStore;
use hostelry_types::error::RepositoryError;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `KvStore`.
pub struct SqliteKvStore {
    pool: DatabasePool,
}

impl SqliteKvStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Live keys starting with `prefix`, sorted.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT key FROM workflow_kv WHERE substr(key, 1, ?) = ? AND expires_at > ? ORDER BY key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .bind(now_millis())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                row.try_get("key")
                    .map_err(|e| RepositoryError::Query(e.to_string()))
            })
            .collect()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_add(ttl_ms)
}

impl KvStore for SqliteKvStore {
    async fn set_with_ttl(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let value_str = serde_json::to_string(value)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize value: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_kv (key, value, expires_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET
                   value = excluded.value,
                   expires_at = excluded.expires_at,
                   updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(&value_str)
        .bind(expiry_millis(ttl))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        let row = sqlx::query("SELECT value FROM workflow_kv WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let value_str: String = row
                    .try_get("value")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                let value = serde_json::from_str(&value_str)
                    .map_err(|e| RepositoryError::Query(format!("invalid JSON value: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM workflow_kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_kv WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
