//! Durable message queue with visibility timeouts and per-delivery receipts.
//!
//! A received message stays in the table; it is only hidden until
//! `visible_at`. Every delivery stamps a fresh random receipt, and every
//! follow-up operation (delete, visibility change, dead-letter) must present
//! it. An operation carrying a stale receipt affects nothing and returns
//! `false`: the message has since been redelivered to someone else.

use crate::error::DatabaseError;
use crate::{Error, Result};
use std::time::Duration;

use super::{Database, QueueRow, duration_ms, now_ms};

impl Database {
    /// Add a message that becomes visible after `delay`
    pub async fn enqueue_message(
        &self,
        article_id: &str,
        payload: &str,
        delay: Duration,
    ) -> Result<i64> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO queue_messages (article_id, payload, visible_at, enqueued_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(article_id)
        .bind(payload)
        .bind(now.saturating_add(duration_ms(delay)))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to enqueue message: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Atomically claim up to `limit` visible messages
    ///
    /// Claimed messages are hidden for `visibility_timeout` and carry a new
    /// receipt; their `receive_count` is incremented.
    pub async fn receive_messages(
        &self,
        limit: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueRow>> {
        let now = now_ms();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut rows: Vec<QueueRow> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET receipt = lower(hex(randomblob(16))),
                receive_count = receive_count + 1,
                visible_at = ?
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE visible_at <= ?
                ORDER BY visible_at ASC, id ASC
                LIMIT ?
            )
            RETURNING id, payload, attempt, receive_count, receipt
            "#,
        )
        .bind(now.saturating_add(duration_ms(visibility_timeout)))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to receive messages: {}",
                e
            )))
        })?;

        // RETURNING order is unspecified
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    /// Delete a message, if `receipt` is still current
    pub async fn delete_message(&self, id: i64, receipt: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND receipt = ?")
            .bind(id)
            .bind(receipt)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete message: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Make a message visible again after `delay`, if `receipt` is still current
    ///
    /// `counted` increments the message's attempt counter; uncounted
    /// redeliveries (lock contention) leave it unchanged.
    pub async fn change_message_visibility(
        &self,
        id: i64,
        receipt: &str,
        delay: Duration,
        counted: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?,
                receipt = NULL,
                attempt = attempt + ?
            WHERE id = ? AND receipt = ?
            "#,
        )
        .bind(now_ms().saturating_add(duration_ms(delay)))
        .bind(i64::from(counted))
        .bind(id)
        .bind(receipt)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to change message visibility: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a message to the dead-letter table, if `receipt` is still current
    ///
    /// Removal and the dead-letter insert happen in one transaction.
    pub async fn dead_letter_message(
        &self,
        id: i64,
        receipt: &str,
        reason: &str,
        last_state: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin dead-letter transaction: {}",
                e
            )))
        })?;

        let removed: Option<(String, String, i64)> = sqlx::query_as(
            r#"
            DELETE FROM queue_messages
            WHERE id = ? AND receipt = ?
            RETURNING article_id, payload, attempt
            "#,
        )
        .bind(id)
        .bind(receipt)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to remove dead-lettered message: {}",
                e
            )))
        })?;

        let Some((article_id, payload, attempts)) = removed else {
            // Dropping the transaction rolls it back
            return Ok(false);
        };

        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                message_id, article_id, reason, last_state, attempts, payload, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&article_id)
        .bind(reason)
        .bind(last_state)
        .bind(attempts)
        .bind(&payload)
        .bind(now_ms())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert dead letter: {}",
                e
            )))
        })?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit dead letter: {}",
                e
            )))
        })?;

        Ok(true)
    }

    /// Number of messages in the queue, visible or not
    pub async fn queue_depth(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count queue messages: {}",
                    e
                )))
            })
    }

    /// Attempt counter and visibility of one message (None once deleted)
    pub async fn message_state(&self, id: i64) -> Result<Option<(i64, i64, i64)>> {
        sqlx::query_as(
            "SELECT attempt, receive_count, visible_at FROM queue_messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read message state: {}",
                e
            )))
        })
    }
}
