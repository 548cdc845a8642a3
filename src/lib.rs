//! # article-ingest
//!
//! Queue-driven article ingestion worker.
//!
//! Each queue message names one article. A worker takes a lease on the
//! article, retrieves its raw content from the first origin that has it,
//! runs the enrichment pipeline (cleaning, metadata, language, images,
//! tags), persists the result across the blob store, the article record and
//! the search index, and then acknowledges, retries or dead-letters the
//! message.
//!
//! ## Design Philosophy
//!
//! - **At-least-once safe** - Every write is idempotent and fenced, so
//!   redelivery and late writers from expired leases cannot corrupt results
//! - **Competing consumers** - Any number of worker processes share one
//!   queue, lock store and database
//! - **Classified failures** - Every failure maps to one error kind and one
//!   queue action; nothing escapes the message handler
//! - **Event-driven** - Consumers subscribe to worker events
//!
//! ## Quick Start
//!
//! ```no_run
//! use article_ingest::{Config, Worker, run_with_shutdown};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file(Path::new("ingest.json"))?;
//!     let worker = Worker::from_config(config).await?;
//!
//!     let mut events = worker.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     worker.start();
//!     run_with_shutdown(worker).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Advisory read-through cache
pub mod cache;
/// Configuration types
pub mod config;
/// Service credentials
pub mod credentials;
/// Database persistence layer
pub mod db;
/// Error types and failure taxonomy
pub mod error;
/// Per-message state machine
pub mod handler;
/// Leased distributed locks
pub mod lock;
/// Tracing setup and shared log fields
pub mod logging;
/// Origin sources and fallback retrieval
pub mod origin;
/// Persistence across blob, record and index stores
pub mod persistence;
/// Enrichment pipeline and built-in stages
pub mod pipeline;
/// Durable message queue and consumer
pub mod queue;
/// Retry logic with exponential backoff
pub mod retry;
/// Collaborator service clients
pub mod services;
/// Core types and events
pub mod types;
/// Worker pool and composition root
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{Error, ErrorKind, Result};
pub use handler::{Disposition, MessageHandler};
pub use lock::{DistributedLock, LockStore};
pub use origin::{OriginRetriever, OriginSource};
pub use persistence::PersistenceCoordinator;
pub use pipeline::{EnrichmentPipeline, EnrichmentStage, FailurePolicy};
pub use queue::{MessageQueue, QueueConsumer};
pub use types::{
    ArticleId, EnrichedArticle, Event, HandlerState, Job, JobMessage, PersistedArticle,
    RawDocument, SourceHint,
};
pub use worker::Worker;

/// Run the worker until a termination signal, then shut it down gracefully
///
/// The worker must already be started. Shutdown stops polling and waits up
/// to `worker.shutdown_timeout` for in-flight jobs.
///
/// Listens for SIGINT everywhere and SIGTERM on Unix.
pub async fn run_with_shutdown(worker: Worker) -> Result<()> {
    wait_for_signal().await;
    worker.shutdown().await
}

/// Resolves on SIGINT, or on SIGTERM where supported
///
/// A handler that cannot be registered (restricted containers) is logged and
/// left pending, so the other signal still works.
async fn wait_for_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => tracing::info!(signal = "SIGINT", "Shutdown requested"),
        _ = terminate() => tracing::info!(signal = "SIGTERM", "Shutdown requested"),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
