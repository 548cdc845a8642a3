//! Durable job queue and the consumer that settles deliveries
//!
//! The queue is at-least-once with competing consumers: a received message is
//! hidden for the visibility timeout and reappears unless it is completed,
//! rescheduled or dead-lettered first. Each delivery carries a receipt; an
//! operation presenting a stale receipt (the message was redelivered to
//! another worker meanwhile) changes nothing and reports `false`.

use crate::error::Result;
use crate::types::{HandlerState, JobMessage};
use async_trait::async_trait;
use std::time::Duration;

mod consumer;
mod sqlite;

pub use consumer::{Delivery, QueueConsumer};
pub use sqlite::SqliteMessageQueue;

/// One claimed message as stored, before its payload is decoded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Queue-assigned message id
    pub id: i64,
    /// Proof of this delivery's claim
    pub receipt: String,
    /// JSON payload as enqueued
    pub payload: String,
    /// Counted processing attempts, starting at 1
    pub attempt: u32,
    /// Raw deliveries including this one
    pub receive_count: u32,
}

/// Queue service operations the consumer needs
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Add a job that becomes visible after `delay`
    async fn enqueue(&self, message: &JobMessage, delay: Duration) -> Result<i64>;

    /// Claim up to `max` visible messages, hiding them for `visibility_timeout`
    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Remove a message for good
    async fn complete(&self, message: &ReceivedMessage) -> Result<bool>;

    /// Make a message visible again after `delay`
    ///
    /// `counted` advances the attempt counter; lock contention does not.
    async fn retry(&self, message: &ReceivedMessage, delay: Duration, counted: bool)
    -> Result<bool>;

    /// Move a message to the dead-letter sink with a recorded reason
    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        last_state: HandlerState,
    ) -> Result<bool>;
}
