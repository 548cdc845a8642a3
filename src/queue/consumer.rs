//! Polling and settlement on top of a [`MessageQueue`]

use super::{MessageQueue, ReceivedMessage};
use crate::config::{QueueConfig, RetryConfig};
use crate::error::Result;
use crate::handler::Disposition;
use crate::logging;
use crate::retry::{backoff_delay, with_retry};
use crate::types::{HandlerState, Job, JobMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A decoded job together with the claim it arrived on
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// The claimed queue message
    pub message: ReceivedMessage,
    /// Its decoded payload
    pub job: Job,
    /// Correlation id for this receive, sent to every downstream service
    pub request_id: String,
}

/// Pulls jobs off the queue and turns handler dispositions into queue actions
#[derive(Clone)]
pub struct QueueConsumer {
    queue: Arc<dyn MessageQueue>,
    config: QueueConfig,
    retry: RetryConfig,
}

impl QueueConsumer {
    /// Consumer over `queue`; `retry` paces polling and settlement after queue errors
    pub fn new(queue: Arc<dyn MessageQueue>, config: QueueConfig, retry: RetryConfig) -> Self {
        Self {
            queue,
            config,
            retry,
        }
    }

    /// The underlying queue
    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    /// Wait up to `wait_time` for at most one job
    pub async fn poll_one(&self, cancel: &CancellationToken) -> Result<Option<Delivery>> {
        Ok(self.poll(1, cancel).await?.into_iter().next())
    }

    /// Wait up to `wait_time` for up to `max` jobs (capped at `batch_size`)
    ///
    /// Returns an empty batch when the wait elapses or `cancel` fires. Queue
    /// errors are retried here with backoff and never attributed to a job.
    /// Undecodable payloads and messages past `max_receives` deliveries are
    /// dead-lettered without being returned.
    pub async fn poll(&self, max: usize, cancel: &CancellationToken) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + self.config.wait_time;
        let batch = max.min(self.config.batch_size).max(1);
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(Vec::new());
            }

            let pause = match self
                .queue
                .receive(batch, self.config.visibility_timeout)
                .await
            {
                Ok(messages) if !messages.is_empty() => {
                    failures = 0;
                    let mut deliveries = Vec::with_capacity(messages.len());
                    for message in messages {
                        if let Some(delivery) = self.admit(message).await {
                            deliveries.push(delivery);
                        }
                    }
                    if !deliveries.is_empty() {
                        return Ok(deliveries);
                    }
                    Duration::ZERO
                }
                Ok(_) => {
                    failures = 0;
                    self.config.poll_interval
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff_delay(&self.retry, failures);
                    tracing::warn!(
                        error = %e,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "Queue receive failed, backing off"
                    );
                    delay
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let pause = pause.min(deadline - now);
            if pause.is_zero() {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(Vec::new()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Decode a claimed message, dead-lettering it when it cannot be processed
    async fn admit(&self, message: ReceivedMessage) -> Option<Delivery> {
        if message.receive_count > self.config.max_receives {
            let reason = format!(
                "delivered {} times, limit is {}",
                message.receive_count, self.config.max_receives
            );
            self.discard(&message, &reason).await;
            return None;
        }

        match serde_json::from_str::<JobMessage>(&message.payload) {
            Ok(payload) => Some(Delivery {
                job: Job {
                    article_id: payload.article_id,
                    source_hint: payload.source_hint,
                    enqueue_time: payload.enqueue_time,
                    delivery_attempt: message.attempt,
                    receive_count: message.receive_count,
                },
                message,
                request_id: logging::new_request_id(),
            }),
            Err(e) => {
                self.discard(&message, &format!("invalid payload: {}", e))
                    .await;
                None
            }
        }
    }

    async fn discard(&self, message: &ReceivedMessage, reason: &str) {
        tracing::warn!(message_id = message.id, reason, "Dead-lettering unprocessable message");
        if let Err(e) = self
            .queue
            .dead_letter(message, reason, HandlerState::Received)
            .await
        {
            // Reappears after the visibility timeout and is discarded again
            tracing::warn!(message_id = message.id, error = %e, "Dead-letter failed");
        }
    }

    /// Remove a finished job from the queue
    pub async fn complete(&self, delivery: &Delivery) -> Result<bool> {
        let done = with_retry(&self.retry, || self.queue.complete(&delivery.message)).await?;
        if !done {
            log_stale(delivery, "complete");
        }
        Ok(done)
    }

    /// Make a job visible again after `delay`
    pub async fn retry(&self, delivery: &Delivery, delay: Duration, counted: bool) -> Result<bool> {
        let done = with_retry(&self.retry, || {
            self.queue.retry(&delivery.message, delay, counted)
        })
        .await?;
        if !done {
            log_stale(delivery, "retry");
        }
        Ok(done)
    }

    /// Move a job to the dead-letter sink
    pub async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
        last_state: HandlerState,
    ) -> Result<bool> {
        let done = with_retry(&self.retry, || {
            self.queue
                .dead_letter(&delivery.message, reason, last_state)
        })
        .await?;
        if !done {
            log_stale(delivery, "dead-letter");
        }
        Ok(done)
    }

    /// Apply a handler's decision to the queue
    ///
    /// Returns `false` when the receipt was stale and nothing changed.
    pub async fn settle(&self, delivery: &Delivery, disposition: &Disposition) -> Result<bool> {
        match disposition {
            Disposition::Ack { .. } => self.complete(delivery).await,
            Disposition::Retry { delay, counted, .. } => {
                self.retry(delivery, *delay, *counted).await
            }
            Disposition::DeadLetter {
                reason, last_state, ..
            } => self.dead_letter(delivery, reason, *last_state).await,
            Disposition::Abandon { .. } => {
                // The visibility timeout brings the message back
                Ok(true)
            }
        }
    }
}

fn log_stale(delivery: &Delivery, operation: &str) {
    tracing::warn!(
        article_id = %delivery.job.article_id,
        message_id = delivery.message.id,
        operation,
        "Receipt no longer current; message was redelivered"
    );
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
