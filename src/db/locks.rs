//! Leased locks with fencing tokens.
//!
//! At most one unexpired lease exists per key: acquisition is a single
//! `INSERT .. ON CONFLICT DO UPDATE .. WHERE expires_at <= now` statement, so
//! SQLite's write serialization is the only arbiter. Rows are never deleted;
//! a released or expired row keeps its fence so the next holder's token is
//! strictly greater.

use crate::error::DatabaseError;
use crate::{Error, Result};
use std::time::Duration;

use super::{Database, LockRow, duration_ms, now_ms};

impl Database {
    /// Try to take the lease on `key`
    ///
    /// Returns the new fencing token, or `None` while another lease is live.
    pub async fn try_acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<(i64, i64)>> {
        let now = now_ms();
        let expires_at = now.saturating_add(duration_ms(ttl));

        sqlx::query_as(
            r#"
            INSERT INTO locks (key, holder, fence, expires_at)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(key) DO UPDATE
                SET holder = excluded.holder,
                    fence = locks.fence + 1,
                    expires_at = excluded.expires_at
                WHERE locks.expires_at <= ?
            RETURNING fence, expires_at
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to acquire lock {}: {}",
                key, e
            )))
        })
    }

    /// Current (or last) lease on `key`
    pub async fn lock_row(&self, key: &str) -> Result<Option<LockRow>> {
        sqlx::query_as("SELECT key, holder, fence, expires_at FROM locks WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read lock {}: {}",
                    key, e
                )))
            })
    }

    /// Extend the lease identified by `fence`
    ///
    /// Returns the new expiry, or `None` if the lease already expired or was
    /// taken over.
    pub async fn renew_lock(&self, key: &str, fence: i64, ttl: Duration) -> Result<Option<i64>> {
        let now = now_ms();
        let expires_at = now.saturating_add(duration_ms(ttl));

        let result = sqlx::query(
            r#"
            UPDATE locks SET expires_at = ?
            WHERE key = ? AND fence = ? AND expires_at > ?
            "#,
        )
        .bind(expires_at)
        .bind(key)
        .bind(fence)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to renew lock {}: {}",
                key, e
            )))
        })?;

        Ok((result.rows_affected() > 0).then_some(expires_at))
    }

    /// Expire the lease identified by `fence` immediately
    ///
    /// A no-op (returns `false`) when that lease already expired or was taken over.
    pub async fn release_lock(&self, key: &str, fence: i64) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE locks SET expires_at = ?
            WHERE key = ? AND fence = ? AND expires_at > ?
            "#,
        )
        .bind(now)
        .bind(key)
        .bind(fence)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to release lock {}: {}",
                key, e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }
}
