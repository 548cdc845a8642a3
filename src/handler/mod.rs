//! Per-message orchestration
//!
//! [`MessageHandler::handle`] drives one delivery through
//! `RECEIVED → LOCKED → RETRIEVED → ENRICHED → PERSISTED` and returns a
//! [`Disposition`] telling the consumer what to do with the message. Nothing
//! else escapes: every failure is classified into an [`ErrorKind`] here,
//! logged with the article id, attempt, state and kind, and turned into a
//! disposition.
//!
//! | Kind | Disposition |
//! |---|---|
//! | `LockContention`, `LockLost` | retry after `contention_delay`, not counted |
//! | `TransientUpstream`, `PersistenceFailure` | counted retry with backoff, dead-letter once attempts are exhausted |
//! | `PermanentContent` | dead-letter |
//! | `Superseded` | ack; a newer lease holder already persisted the article |
//! | `DeadlineExceeded` | abandon; the message reappears after its visibility timeout |
//!
//! The lease is renewed between stages and released once processing ends,
//! whatever the outcome. Cancellation is honoured at state boundaries and
//! during retrieval and enrichment, never during the persistence commit.

use crate::config::{QueueConfig, RetryConfig};
use crate::error::{Error, ErrorKind, LockError, PersistenceError};
use crate::lock::{DistributedLock, Lock, LockOutcome};
use crate::logging;
use crate::origin::OriginRetriever;
use crate::persistence::PersistenceCoordinator;
use crate::pipeline::{EnrichmentPipeline, PipelineError};
use crate::retry::{IsRetryable, backoff_delay};
use crate::types::{Degradation, EnrichedArticle, HandlerState, Job, RawDocument};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the consumer should do with a delivery
#[derive(Clone, Debug, PartialEq)]
pub enum Disposition {
    /// Delete the message; the article is persisted
    Ack {
        /// Stored version, `None` when a newer lease holder wrote first
        version: Option<i64>,
        /// Stages that did not contribute
        degradations: Vec<Degradation>,
    },

    /// Make the message visible again after `delay`
    Retry {
        /// Redelivery delay
        delay: Duration,
        /// Whether this counts toward the attempt limit
        counted: bool,
        /// Why
        kind: ErrorKind,
        /// State the job was in when it failed
        state: HandlerState,
        /// Failure description
        reason: String,
    },

    /// Move the message to the dead-letter sink
    DeadLetter {
        /// Recorded reason
        reason: String,
        /// State the job was in when it failed
        last_state: HandlerState,
        /// Why
        kind: ErrorKind,
    },

    /// Leave the message alone; it reappears after its visibility timeout
    Abandon {
        /// Why
        kind: ErrorKind,
        /// State the job was in when it stopped
        state: HandlerState,
    },
}

impl Disposition {
    /// Failure kind behind this disposition, `None` for a clean ack
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Disposition::Ack { version: None, .. } => Some(ErrorKind::Superseded),
            Disposition::Ack { .. } => None,
            Disposition::Retry { kind, .. }
            | Disposition::DeadLetter { kind, .. }
            | Disposition::Abandon { kind, .. } => Some(*kind),
        }
    }
}

/// A failed transition, before it is turned into a disposition
#[derive(Debug)]
struct Failure {
    state: HandlerState,
    kind: ErrorKind,
    reason: String,
}

impl Failure {
    fn new(state: HandlerState, kind: ErrorKind, reason: impl std::fmt::Display) -> Self {
        Self {
            state,
            kind,
            reason: reason.to_string(),
        }
    }

    fn deadline(state: HandlerState) -> Self {
        Self::new(state, ErrorKind::DeadlineExceeded, "job deadline exceeded")
    }

    /// Classify an error from the lock store or a renewal
    fn from_lock(state: HandlerState, err: Error) -> Self {
        match err {
            Error::Lock(LockError::Lost { .. }) => Self::new(state, ErrorKind::LockLost, err),
            other => Self::new(state, ErrorKind::TransientUpstream, other),
        }
    }

    /// Classify an origin failure
    fn from_retrieval(err: Error) -> Self {
        let kind = if err.is_retryable() {
            ErrorKind::TransientUpstream
        } else {
            ErrorKind::PermanentContent
        };
        Self::new(HandlerState::Locked, kind, err)
    }

    /// Classify a failure of a fail-job stage
    fn from_pipeline(err: PipelineError) -> Self {
        let kind = if err.is_transient() {
            ErrorKind::TransientUpstream
        } else {
            ErrorKind::PermanentContent
        };
        Self::new(HandlerState::Retrieved, kind, err)
    }

    /// Classify a commit failure; only `Superseded` is not a persistence failure
    fn from_commit(err: Error) -> Self {
        let kind = match err {
            Error::Persistence(PersistenceError::Superseded { .. }) => ErrorKind::Superseded,
            _ => ErrorKind::PersistenceFailure,
        };
        Self::new(HandlerState::Enriched, kind, err)
    }
}

/// Sequences lock, retrieval, enrichment and persistence for one job
#[derive(Clone)]
pub struct MessageHandler {
    lock: DistributedLock,
    origins: OriginRetriever,
    pipeline: EnrichmentPipeline,
    persistence: PersistenceCoordinator,
    contention_delay: Duration,
    redelivery_delay: Duration,
    retry: RetryConfig,
}

impl MessageHandler {
    /// Handler over the given collaborators
    ///
    /// `queue` supplies the contention and redelivery delays; `retry` the
    /// attempt limit and backoff for counted retries.
    pub fn new(
        lock: DistributedLock,
        origins: OriginRetriever,
        pipeline: EnrichmentPipeline,
        persistence: PersistenceCoordinator,
        queue: &QueueConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            lock,
            origins,
            pipeline,
            persistence,
            contention_delay: queue.contention_delay,
            redelivery_delay: queue.redelivery_delay,
            retry,
        }
    }

    /// The article lock
    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Process one delivery and decide what happens to its message
    pub async fn handle(&self, job: &Job, cancel: &CancellationToken) -> Disposition {
        if cancel.is_cancelled() {
            return self.decide(job, Failure::deadline(HandlerState::Received));
        }

        // RECEIVED -> LOCKED
        let mut lease = match self.lock.acquire(&job.article_id).await {
            Ok(LockOutcome::Acquired(lease)) => lease,
            Ok(LockOutcome::AlreadyHeld) => {
                let failure = Failure::new(
                    HandlerState::Received,
                    ErrorKind::LockContention,
                    "lease held by another worker",
                );
                return self.decide(job, failure);
            }
            Err(e) => return self.decide(job, Failure::from_lock(HandlerState::Received, e)),
        };

        let outcome = self.process(job, &mut lease, cancel).await;

        // Released whatever the outcome; an expired lease makes this a no-op
        if let Err(e) = self.lock.release(&lease).await {
            tracing::warn!(
                { logging::ARTICLE_ID } = %job.article_id,
                fence = lease.fence,
                error = %e,
                "Lease release failed; it will expire on its own"
            );
        }

        match outcome {
            Ok((version, degradations)) => {
                tracing::info!(
                    { logging::ARTICLE_ID } = %job.article_id,
                    { logging::ATTEMPT } = job.delivery_attempt,
                    version,
                    degraded = !degradations.is_empty(),
                    "Article persisted"
                );
                Disposition::Ack {
                    version: Some(version),
                    degradations,
                }
            }
            Err(failure) => self.decide(job, failure),
        }
    }

    /// LOCKED -> RETRIEVED -> ENRICHED -> PERSISTED
    async fn process(
        &self,
        job: &Job,
        lease: &mut Lock,
        cancel: &CancellationToken,
    ) -> Result<(i64, Vec<Degradation>), Failure> {
        let raw: RawDocument = bounded(
            cancel,
            HandlerState::Locked,
            self.origins.fetch(&job.article_id, job.source_hint),
        )
        .await?
        .map_err(Failure::from_retrieval)?;

        self.renew(lease, cancel, HandlerState::Retrieved).await?;

        let enriched: EnrichedArticle =
            bounded(cancel, HandlerState::Retrieved, self.pipeline.run(&raw))
                .await?
                .map_err(Failure::from_pipeline)?;

        for degradation in &enriched.degradations {
            tracing::warn!(
                { logging::ARTICLE_ID } = %job.article_id,
                { logging::ATTEMPT } = job.delivery_attempt,
                { logging::STATE } = %HandlerState::Retrieved,
                { logging::ERROR_KIND } = %ErrorKind::DegradedStage,
                stage = %degradation.stage,
                reason = %degradation.reason,
                "Stage degraded"
            );
        }

        self.renew(lease, cancel, HandlerState::Enriched).await?;

        // Not cancellable: a commit is either finished or retried from scratch
        let article = self
            .persistence
            .commit(&raw, &enriched, lease.fence)
            .await
            .map_err(Failure::from_commit)?;

        Ok((article.version, enriched.degradations))
    }

    /// Extend the lease at a state boundary, stopping if the deadline passed
    async fn renew(
        &self,
        lease: &mut Lock,
        cancel: &CancellationToken,
        state: HandlerState,
    ) -> Result<(), Failure> {
        if cancel.is_cancelled() {
            return Err(Failure::deadline(state));
        }
        self.lock
            .renew(lease)
            .await
            .map_err(|e| Failure::from_lock(state, e))
    }

    /// Turn a failure into a disposition and log it
    fn decide(&self, job: &Job, failure: Failure) -> Disposition {
        let disposition = match failure.kind {
            ErrorKind::LockContention | ErrorKind::LockLost => Disposition::Retry {
                delay: self.contention_delay,
                counted: false,
                kind: failure.kind,
                state: failure.state,
                reason: failure.reason.clone(),
            },
            ErrorKind::TransientUpstream | ErrorKind::PersistenceFailure => {
                if job.delivery_attempt >= self.retry.max_attempts {
                    Disposition::DeadLetter {
                        reason: format!(
                            "{}: {} (attempt {} of {})",
                            failure.kind,
                            failure.reason,
                            job.delivery_attempt,
                            self.retry.max_attempts
                        ),
                        last_state: failure.state,
                        kind: failure.kind,
                    }
                } else {
                    Disposition::Retry {
                        delay: self
                            .redelivery_delay
                            .max(backoff_delay(&self.retry, job.delivery_attempt)),
                        counted: true,
                        kind: failure.kind,
                        state: failure.state,
                        reason: failure.reason.clone(),
                    }
                }
            }
            ErrorKind::PermanentContent | ErrorKind::DegradedStage => Disposition::DeadLetter {
                reason: format!("{}: {}", failure.kind, failure.reason),
                last_state: failure.state,
                kind: failure.kind,
            },
            ErrorKind::Superseded => Disposition::Ack {
                version: None,
                degradations: Vec::new(),
            },
            ErrorKind::DeadlineExceeded => Disposition::Abandon {
                kind: failure.kind,
                state: failure.state,
            },
        };

        match failure.kind {
            ErrorKind::LockContention | ErrorKind::Superseded => tracing::info!(
                { logging::ARTICLE_ID } = %job.article_id,
                { logging::ATTEMPT } = job.delivery_attempt,
                { logging::STATE } = %failure.state,
                { logging::ERROR_KIND } = %failure.kind,
                reason = %failure.reason,
                "Job deferred to another worker"
            ),
            _ => tracing::warn!(
                { logging::ARTICLE_ID } = %job.article_id,
                { logging::ATTEMPT } = job.delivery_attempt,
                { logging::STATE } = %failure.state,
                { logging::ERROR_KIND } = %failure.kind,
                reason = %failure.reason,
                disposition = disposition_name(&disposition),
                "Job transition failed"
            ),
        }

        disposition
    }
}

fn disposition_name(disposition: &Disposition) -> &'static str {
    match disposition {
        Disposition::Ack { .. } => "ack",
        Disposition::Retry { .. } => "retry",
        Disposition::DeadLetter { .. } => "dead_letter",
        Disposition::Abandon { .. } => "abandon",
    }
}

/// Run `work` unless `cancel` fires first
async fn bounded<T>(
    cancel: &CancellationToken,
    state: HandlerState,
    work: impl Future<Output = T>,
) -> Result<T, Failure> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Failure::deadline(state)),
        result = work => Ok(result),
    }
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("lock", &self.lock)
            .field("origins", &self.origins)
            .field("pipeline", &self.pipeline)
            .field("contention_delay", &self.contention_delay)
            .field("redelivery_delay", &self.redelivery_delay)
            .finish_non_exhaustive()
    }
}
