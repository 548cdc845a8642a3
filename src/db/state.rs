//! Runtime state: clean-shutdown tracking and small worker bookkeeping values.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

const CLEAN_SHUTDOWN: &str = "clean_shutdown";

impl Database {
    /// Check if the last worker session ended without `set_clean_shutdown()`
    ///
    /// A crashed worker leaves leases to expire and messages to reappear on
    /// their own; this flag only exists so the next start can log it.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value = self.runtime_value(CLEAN_SHUTDOWN).await?;
        Ok(value.is_none_or(|v| v != "true"))
    }

    /// Mark that a worker session has started
    pub async fn set_clean_start(&self) -> Result<()> {
        self.set_runtime_value(CLEAN_SHUTDOWN, "false").await
    }

    /// Mark that the worker session is ending gracefully
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_runtime_value(CLEAN_SHUTDOWN, "true").await
    }

    /// Read a runtime state value
    pub async fn runtime_value(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read runtime state {}: {}",
                    key, e
                )))
            })
    }

    /// Insert or overwrite a runtime state value
    pub async fn set_runtime_value(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write runtime state {}: {}",
                key, e
            )))
        })?;

        Ok(())
    }
}
