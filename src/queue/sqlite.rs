//! Queue backed by the shared SQLite database

use super::{MessageQueue, ReceivedMessage};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{HandlerState, JobMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// [`MessageQueue`] over the `queue_messages` and `dead_letters` tables
#[derive(Clone)]
pub struct SqliteMessageQueue {
    db: Arc<Database>,
}

impl SqliteMessageQueue {
    /// Queue stored in `db`
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Messages currently in the queue, visible or not
    pub async fn depth(&self) -> Result<i64> {
        self.db.queue_depth().await.map_err(queue_error)
    }
}

/// Queue service failures are transient by nature; keep them distinguishable
fn queue_error(err: Error) -> Error {
    match err {
        Error::Queue(_) => err,
        other => Error::Queue(other.to_string()),
    }
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[async_trait]
impl MessageQueue for SqliteMessageQueue {
    async fn enqueue(&self, message: &JobMessage, delay: Duration) -> Result<i64> {
        let payload = serde_json::to_string(message)?;
        self.db
            .enqueue_message(message.article_id.as_str(), &payload, delay)
            .await
            .map_err(queue_error)
    }

    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let rows = self
            .db
            .receive_messages(max, visibility_timeout)
            .await
            .map_err(queue_error)?;

        Ok(rows
            .into_iter()
            .map(|row| ReceivedMessage {
                id: row.id,
                receipt: row.receipt,
                payload: row.payload,
                attempt: to_u32(row.attempt),
                receive_count: to_u32(row.receive_count),
            })
            .collect())
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<bool> {
        self.db
            .delete_message(message.id, &message.receipt)
            .await
            .map_err(queue_error)
    }

    async fn retry(
        &self,
        message: &ReceivedMessage,
        delay: Duration,
        counted: bool,
    ) -> Result<bool> {
        self.db
            .change_message_visibility(message.id, &message.receipt, delay, counted)
            .await
            .map_err(queue_error)
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        last_state: HandlerState,
    ) -> Result<bool> {
        self.db
            .dead_letter_message(message.id, &message.receipt, reason, last_state.as_str())
            .await
            .map_err(queue_error)
    }
}
