//! Dead-letter sink queries.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, DeadLetterRow};

impl Database {
    /// All dead letters, oldest first
    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRow>> {
        sqlx::query_as(
            r#"
            SELECT id, message_id, article_id, reason, last_state, attempts, payload, created_at
            FROM dead_letters
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list dead letters: {}",
                e
            )))
        })
    }

    /// Dead letters recorded for one article
    pub async fn dead_letters_for(&self, article_id: &str) -> Result<Vec<DeadLetterRow>> {
        sqlx::query_as(
            r#"
            SELECT id, message_id, article_id, reason, last_state, attempts, payload, created_at
            FROM dead_letters
            WHERE article_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list dead letters for {}: {}",
                article_id, e
            )))
        })
    }

    /// Remove a dead letter after it has been inspected or replayed
    pub async fn delete_dead_letter(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete dead letter: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
