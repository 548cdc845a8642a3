//! Advisory key/value cache rows.

use crate::error::DatabaseError;
use crate::{Error, Result};
use std::time::Duration;

use super::{Database, duration_ms, now_ms};

impl Database {
    /// Unexpired value for `key`
    pub async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM cache_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now_ms())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read cache entry: {}",
                    e
                )))
            })
    }

    /// Store `value` under `key` for `ttl`
    pub async fn cache_put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_ms().saturating_add(duration_ms(ttl)))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write cache entry: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Drop `key`
    pub async fn cache_delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete cache entry: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Delete expired entries, returning how many were removed
    pub async fn cache_purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to purge cache entries: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }
}
