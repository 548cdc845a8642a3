//! Retry logic with exponential backoff
//!
//! Two consumers share one [`RetryConfig`]:
//! - in-process retries of a single call ([`with_retry`]), used when settling
//!   a delivery on the queue
//! - redelivery delays for whole jobs ([`backoff_delay`]), which the message
//!   handler hands back to the queue instead of sleeping
//!
//! # Example
//!
//! ```no_run
//! use article_ingest::config::RetryConfig;
//! use article_ingest::retry::with_retry;
//! use article_ingest::{Error, Result};
//!
//! # async fn example() -> Result<()> {
//! let config = RetryConfig::default();
//! let depth = with_retry(&config, || async {
//!     // A queue error is transient and will be retried
//!     Ok::<_, Error>(0u64)
//! })
//! .await?;
//! # let _ = depth;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DatabaseError, Error, LockError, PersistenceError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, throttling, connection reset) should return `true`.
/// Permanent failures (bad configuration, not found, corrupt data) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Upstream(e) => e.is_transient(),
            Error::Timeout { .. } => true,
            // SQLite reports writer contention as "database is locked"
            Error::Sqlx(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db) => db.message().contains("locked"),
                _ => false,
            },
            // Query errors only carry the driver message
            Error::Database(DatabaseError::QueryFailed(message)) => {
                message.contains("database is locked") || message.contains("pool timed out")
            }
            Error::Database(_) => false,
            Error::Lock(LockError::Store(_)) => true,
            Error::Lock(LockError::Lost { .. }) => false,
            Error::Persistence(PersistenceError::Superseded { .. }) => false,
            Error::Persistence(_) => true,
            Error::Queue(_) => true,
            Error::Credential(_) => true,
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
            Error::NotFound(_) => false,
            Error::ShuttingDown => false,
            Error::Other(_) => false,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently or runs out of retries
///
/// The call is made once plus up to `config.max_attempts` retries. The wait
/// before retry `n` is [`backoff_delay`] for attempt `n`, so in-process
/// retries and job redeliveries share one schedule.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut retries: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::debug!(retries, "Call succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            tracing::debug!(error = %err, "Call failed with a permanent error");
            return Err(err);
        }
        if retries >= config.max_attempts {
            tracing::warn!(error = %err, retries, "Giving up on call");
            return Err(err);
        }

        retries += 1;
        let delay = backoff_delay(config, retries);
        tracing::warn!(
            error = %err,
            retry = retries,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Call failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Delay before the next delivery of a job that failed its `attempt`-th try
///
/// `initial_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`,
/// then jittered when enabled. Attempt numbers start at 1; 0 is treated as 1.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let base = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let capped = if base.is_finite() && base < config.max_delay.as_secs_f64() {
        Duration::from_secs_f64(base)
    } else {
        config.max_delay
    };

    if config.jitter {
        add_jitter(capped)
    } else {
        capped
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
