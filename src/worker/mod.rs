//! Worker pool and composition root
//!
//! A [`Worker`] polls the queue for as many messages as it has free permits,
//! spawns one task per delivery and settles each handler [`Disposition`] on
//! the queue. Parallelism across processes comes from the queue's competing
//! consumers; the in-process pool only bounds how many jobs one process
//! holds at a time.
//!
//! Every job runs under a child [`CancellationToken`] that fires at
//! `job_deadline`. The handler then abandons at its next state boundary,
//! releasing the lease and leaving the message to its visibility timeout.

use crate::cache::{Cache, MemoryCache, ReadThroughCache, SqliteCache};
use crate::config::{CacheBackend, Config, ServiceEndpoint, WorkerConfig};
use crate::credentials::{CredentialProvider, HttpTokenSource, RefreshingCredentialProvider};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::handler::{Disposition, MessageHandler};
use crate::lock::{DistributedLock, LockStore, generate_holder_id};
use crate::logging;
use crate::origin::{HttpOriginSource, OriginRetriever, OriginSource};
use crate::persistence::{FsBlobStore, PersistenceCoordinator, SearchIndex};
use crate::pipeline::{
    EnrichmentPipeline, EnrichmentStage, HtmlCleaningStage, ImageStage, LanguageStage,
    MetadataStage, TaggingStage,
};
use crate::queue::{Delivery, QueueConsumer, SqliteMessageQueue};
use crate::services::{
    HttpHtmlCleaner, HttpImageSizer, HttpLanguageService, HttpSearchIndex, HttpTagger,
    ServiceClient,
};
use crate::types::{Event, Job};
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast};
use tracing::Instrument;
use tokio_util::sync::CancellationToken;

/// Capacity of the event channel; slow subscribers miss older events
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Bounded pool of message handlers fed by one queue consumer
#[derive(Clone)]
pub struct Worker {
    consumer: QueueConsumer,
    handler: Arc<MessageHandler>,
    config: WorkerConfig,
    /// One permit per in-flight job
    limiter: Arc<Semaphore>,
    /// Stops polling
    polling: CancellationToken,
    /// Parent of every job's deadline token
    jobs: CancellationToken,
    event_tx: broadcast::Sender<Event>,
    /// Runtime state table, when the worker owns a database
    db: Option<Arc<Database>>,
}

impl Worker {
    /// Worker handling messages from `consumer` with `handler`
    pub fn new(consumer: QueueConsumer, handler: MessageHandler, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            consumer,
            handler: Arc::new(handler),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            polling: CancellationToken::new(),
            jobs: CancellationToken::new(),
            event_tx,
            db: None,
        }
    }

    /// Record clean shutdown in `db` when the worker stops
    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    /// Build the production graph described by `config`
    ///
    /// SQLite backs the queue, the lock store and the local search index; the
    /// cache follows `cache.backend`. With the `redis` feature and a Redis
    /// backend, locks live in Redis too. Enrichment stages whose service is
    /// not configured are left out of the pipeline.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        if db.was_unclean_shutdown().await? {
            tracing::warn!(
                "Previous run did not shut down cleanly; expired leases and visibility timeouts return its jobs"
            );
        }
        db.set_clean_start().await?;

        let credentials: Option<Arc<dyn CredentialProvider>> = match &config.services.auth {
            Some(auth) => Some(Arc::new(RefreshingCredentialProvider::new(
                Box::new(HttpTokenSource::new(auth)?),
                auth.refresh_margin,
            ))),
            None => None,
        };

        let holder_id = config
            .service
            .holder_id
            .clone()
            .unwrap_or_else(generate_holder_id);
        let lock = DistributedLock::new(
            lock_store(&config, &db)?,
            config.service.prefix.clone(),
            holder_id.clone(),
            config.lock.lease_ttl,
        );

        let origins = config
            .origins
            .iter()
            .map(|origin| {
                HttpOriginSource::new(origin, credentials.clone())
                    .map(|source| Arc::new(source) as Arc<dyn OriginSource>)
            })
            .collect::<Result<Vec<_>>>()?;

        let cache =
            ReadThroughCache::new(cache_backend(&config, &db)?, config.service.prefix.clone());
        let pipeline = EnrichmentPipeline::new(
            build_stages(&config, cache, credentials.clone())?,
            &config.pipeline,
        )?;

        let index: Arc<dyn SearchIndex> = match &config.services.search_index {
            Some(endpoint) => Arc::new(HttpSearchIndex::new(ServiceClient::new(
                "search_index",
                endpoint,
                credentials.clone(),
            )?)),
            None => db.clone(),
        };
        let persistence = PersistenceCoordinator::new(
            Arc::new(FsBlobStore::new(config.persistence.blob_dir.clone())),
            db.clone(),
            index,
        );

        let handler = MessageHandler::new(
            lock,
            OriginRetriever::new(origins),
            pipeline,
            persistence,
            &config.queue,
            config.retry.clone(),
        );
        let consumer = QueueConsumer::new(
            Arc::new(SqliteMessageQueue::new(db.clone())),
            config.queue.clone(),
            config.retry.clone(),
        );

        tracing::info!(
            holder_id = %holder_id,
            max_concurrent_jobs = config.worker.max_concurrent_jobs,
            "Worker configured"
        );

        Ok(Self::new(consumer, handler, config.worker.clone()).with_database(db))
    }

    /// Subscribe to worker events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Permits in use, by running jobs or by a poll waiting for messages
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_jobs - self.limiter.available_permits()
    }

    /// Start the polling loop in the background
    ///
    /// The loop waits for a free permit, claims up to as many messages as
    /// there are free permits, and spawns one task per delivery. It ends when
    /// [`Worker::shutdown`] is called.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move { worker.poll_loop().await })
    }

    async fn poll_loop(&self) {
        tracing::info!("Worker polling started");
        loop {
            let first = tokio::select! {
                _ = self.polling.cancelled() => break,
                permit = self.limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let mut permits = vec![first];
            while let Ok(permit) = self.limiter.clone().try_acquire_owned() {
                permits.push(permit);
            }

            let deliveries = match self.consumer.poll(permits.len(), &self.polling).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    tracing::warn!(error = %e, "Queue poll failed");
                    continue;
                }
            };

            // Permits left over from a short batch are released here
            for (delivery, permit) in deliveries.into_iter().zip(permits) {
                let worker = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    worker.run_job(delivery).await;
                });
            }
        }
        tracing::info!("Worker polling stopped");
    }

    /// Handle one delivery under its deadline and settle the outcome
    async fn run_job(&self, delivery: Delivery) {
        let job = &delivery.job;
        self.emit(Event::JobStarted {
            article_id: job.article_id.clone(),
            attempt: job.delivery_attempt,
        });

        let span = tracing::info_span!(
            "job",
            { logging::ARTICLE_ID } = %job.article_id,
            { logging::ATTEMPT } = job.delivery_attempt,
            { logging::REQUEST_ID } = %delivery.request_id,
        );
        let cancel = self.jobs.child_token();
        let handling = logging::with_request_id(
            delivery.request_id.clone(),
            self.handler.handle(job, &cancel),
        )
        .instrument(span.clone());
        tokio::pin!(handling);
        let disposition = tokio::select! {
            disposition = &mut handling => disposition,
            _ = tokio::time::sleep(self.config.job_deadline) => {
                tracing::warn!(
                    { logging::ARTICLE_ID } = %job.article_id,
                    { logging::ATTEMPT } = job.delivery_attempt,
                    deadline_secs = self.config.job_deadline.as_secs(),
                    "Job deadline reached, abandoning at the next state boundary"
                );
                cancel.cancel();
                handling.await
            }
        };

        match self
            .consumer
            .settle(&delivery, &disposition)
            .instrument(span)
            .await
        {
            Ok(true) => self.emit_outcome(job, disposition),
            // Already redelivered; the newer delivery reports its own outcome
            Ok(false) => {}
            Err(e) => tracing::warn!(
                { logging::ARTICLE_ID } = %job.article_id,
                error = %e,
                "Settlement failed; the message reappears after its visibility timeout"
            ),
        }
    }

    fn emit_outcome(&self, job: &Job, disposition: Disposition) {
        let article_id = job.article_id.clone();
        match disposition {
            Disposition::Ack {
                version: Some(version),
                degradations,
            } => {
                let degraded = !degradations.is_empty();
                for degradation in degradations {
                    self.emit(Event::StageDegraded {
                        article_id: article_id.clone(),
                        stage: degradation.stage,
                        reason: degradation.reason,
                    });
                }
                self.emit(Event::JobCompleted {
                    article_id,
                    version,
                    degraded,
                });
            }
            // Superseded: the newer lease holder reports completion
            Disposition::Ack { version: None, .. } => {}
            Disposition::Retry { delay, counted, .. } => self.emit(Event::JobRetried {
                article_id,
                delay,
                counted,
            }),
            Disposition::DeadLetter { reason, .. } => {
                self.emit(Event::JobDeadLettered { article_id, reason })
            }
            Disposition::Abandon { .. } => self.emit(Event::JobAbandoned { article_id }),
        }
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Stop polling and wait for in-flight jobs
    ///
    /// Jobs still running after `shutdown_timeout` are cancelled; they
    /// abandon at their next state boundary and their messages are
    /// redelivered. A commit already under way is allowed to finish, so the
    /// worker waits up to another `shutdown_timeout` for the cancelled jobs
    /// to settle. Only a worker that ends with no job in flight records a
    /// clean shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(in_flight = self.in_flight(), "Initiating graceful shutdown");
        self.polling.cancel();

        let mut idle = self.wait_for_idle_within().await;
        if !idle {
            tracing::warn!(
                in_flight = self.in_flight(),
                "Timeout waiting for in-flight jobs, cancelling them"
            );
            self.jobs.cancel();
            idle = self.wait_for_idle_within().await;
        }

        if !idle {
            tracing::error!(
                in_flight = self.in_flight(),
                "Cancelled jobs did not settle; leaving shutdown marked unclean"
            );
        } else if let Some(db) = &self.db {
            if let Err(e) = db.set_clean_shutdown().await {
                tracing::error!(error = %e, "Failed to mark clean shutdown in database");
            } else {
                tracing::info!("Marked clean shutdown in database");
            }
        }

        self.emit(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Whether every job settled within `shutdown_timeout`
    async fn wait_for_idle_within(&self) -> bool {
        match tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_idle()).await {
            Ok(Ok(())) => {
                tracing::info!("All in-flight jobs finished");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Error while waiting for in-flight jobs");
                false
            }
            Err(_) => false,
        }
    }

    /// Resolves once every permit is free again
    async fn wait_for_idle(&self) -> Result<()> {
        let permits = u32::try_from(self.config.max_concurrent_jobs)
            .map_err(|_| Error::config("worker.max_concurrent_jobs", "too large"))?;
        let _all = self
            .limiter
            .acquire_many(permits)
            .await
            .map_err(|_| Error::ShuttingDown)?;
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

/// Lock store for `config`: Redis when selected and compiled in, else SQLite
fn lock_store(config: &Config, db: &Arc<Database>) -> Result<Arc<dyn LockStore>> {
    match config.cache.backend {
        CacheBackend::Redis => redis_lock_store(config),
        CacheBackend::Memory | CacheBackend::Sqlite => Ok(db.clone()),
    }
}

fn cache_backend(config: &Config, db: &Arc<Database>) -> Result<Arc<dyn Cache>> {
    let cache: Arc<dyn Cache> = match config.cache.backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new(
            config.cache.max_entries,
            config.cache.ttl,
        )),
        CacheBackend::Sqlite => Arc::new(SqliteCache::new(db.clone(), config.cache.ttl)),
        CacheBackend::Redis => redis_cache(config)?,
    };
    Ok(cache)
}

#[cfg(feature = "redis")]
fn redis_url(config: &Config) -> Result<&str> {
    config
        .cache
        .redis_url
        .as_deref()
        .ok_or_else(|| Error::config("cache.redis_url", "required for the redis backend"))
}

#[cfg(feature = "redis")]
fn redis_lock_store(config: &Config) -> Result<Arc<dyn LockStore>> {
    Ok(Arc::new(crate::lock::RedisLockStore::new(redis_url(config)?)?))
}

#[cfg(feature = "redis")]
fn redis_cache(config: &Config) -> Result<Arc<dyn Cache>> {
    Ok(Arc::new(crate::cache::RedisCache::new(
        redis_url(config)?,
        config.cache.ttl,
    )?))
}

#[cfg(not(feature = "redis"))]
fn redis_lock_store(_config: &Config) -> Result<Arc<dyn LockStore>> {
    Err(Error::config(
        "cache.backend",
        "redis backend requires the `redis` feature",
    ))
}

#[cfg(not(feature = "redis"))]
fn redis_cache(_config: &Config) -> Result<Arc<dyn Cache>> {
    Err(Error::config(
        "cache.backend",
        "redis backend requires the `redis` feature",
    ))
}

/// Stages in execution order: cleaning, metadata, language, images, tagging
fn build_stages(
    config: &Config,
    cache: ReadThroughCache,
    credentials: Option<Arc<dyn CredentialProvider>>,
) -> Result<Vec<Arc<dyn EnrichmentStage>>> {
    let services = &config.services;
    let client = |name: &str, endpoint: &ServiceEndpoint| ServiceClient::new(name, endpoint, credentials.clone());
    let mut stages: Vec<Arc<dyn EnrichmentStage>> = Vec::new();

    if let Some(endpoint) = &services.html_cleaner {
        stages.push(Arc::new(HtmlCleaningStage::new(Arc::new(HttpHtmlCleaner::new(
            client("html_cleaner", endpoint)?,
        )))));
    }

    stages.push(Arc::new(MetadataStage::new()?));

    if let Some(endpoint) = &services.language {
        stages.push(Arc::new(LanguageStage::new(
            Arc::new(HttpLanguageService::new(client("language", endpoint)?)),
            config.pipeline.target_languages.clone(),
        )));
    }

    if let Some(endpoint) = &services.image_sizer {
        stages.push(Arc::new(ImageStage::new(
            Arc::new(HttpImageSizer::new(client("image_sizer", endpoint)?)),
            cache,
            config.pipeline.min_image_width,
            config.pipeline.min_image_height,
        )?));
    }

    match (&services.tagger, &services.language) {
        (Some(endpoint), Some(_)) => {
            stages.push(Arc::new(TaggingStage::new(Arc::new(HttpTagger::new(
                client("tagger", endpoint)?,
            )))));
        }
        (Some(_), None) => {
            tracing::warn!("Tagging needs the language service; tagging stage disabled");
        }
        (None, _) => {}
    }

    Ok(stages)
}
