//! Error types for article-ingest
//!
//! This module provides error handling for the worker, including:
//! - The crate-wide [`Error`] with conversions from the underlying libraries
//! - Domain-specific errors (database, upstream services, locks, persistence)
//! - The [`ErrorKind`] taxonomy the message handler uses to decide between
//!   acknowledging, retrying and dead-lettering a job

use std::time::Duration;
use thiserror::Error;

/// Result type alias for article-ingest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for article-ingest
///
/// Each variant carries enough context to diagnose the failure from a single
/// log line.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "queue.batch_size")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error raised by the HTTP client before a response was classified
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A black-box collaborator service failed
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Lock store failure
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Blob, record or index write failed
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Credential could not be obtained or refreshed
    #[error("credential error: {0}")]
    Credential(String),

    /// Queue service error (receive, delete, visibility change)
    #[error("queue error: {0}")]
    Queue(String),

    /// An external call did not finish within its bound
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out (e.g., "lock acquire")
        operation: String,
        /// The bound that was exceeded
        after: Duration,
    },

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Requested record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Stored value could not be decoded
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Failure of a request/response call to a collaborator service
///
/// Services are black boxes: the only thing the worker needs to know is
/// whether trying again later could succeed.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The call did not complete within its timeout
    #[error("{service} timed out")]
    Timeout {
        /// Service name (e.g., "tagger")
        service: String,
    },

    /// Connection could not be established or was reset
    #[error("{service} connection failed: {message}")]
    Connection {
        /// Service name
        service: String,
        /// Underlying transport message
        message: String,
    },

    /// Service answered with a server-side or throttling status
    #[error("{service} unavailable (HTTP {status})")]
    Unavailable {
        /// Service name
        service: String,
        /// HTTP status code (5xx or 429)
        status: u16,
    },

    /// The requested resource does not exist at this service
    #[error("{service} has no {resource}")]
    NotFound {
        /// Service name
        service: String,
        /// What was looked up (article id, image URL, ...)
        resource: String,
    },

    /// Service refused the credential (HTTP 401/403)
    ///
    /// Transient: the token may have expired or been rotated, and the next
    /// attempt presents a freshly issued one.
    #[error("{service} refused credential (HTTP {status}): {message}")]
    Unauthorized {
        /// Service name
        service: String,
        /// HTTP status code
        status: u16,
        /// Response body excerpt
        message: String,
    },

    /// Service refused the request (4xx other than 401/403/404/429)
    #[error("{service} rejected request (HTTP {status}): {message}")]
    Rejected {
        /// Service name
        service: String,
        /// HTTP status code
        status: u16,
        /// Response body excerpt
        message: String,
    },

    /// Response body could not be understood
    #[error("{service} returned an invalid response: {message}")]
    InvalidResponse {
        /// Service name
        service: String,
        /// Decode failure description
        message: String,
    },
}

impl UpstreamError {
    /// Whether a later attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpstreamError::Timeout { .. }
                | UpstreamError::Connection { .. }
                | UpstreamError::Unavailable { .. }
                | UpstreamError::Unauthorized { .. }
        )
    }

    /// Whether the service refused the credential rather than the request
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, UpstreamError::Unauthorized { .. })
    }

    /// Whether the service reported the resource as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, UpstreamError::NotFound { .. })
    }

    /// Classify a transport error from reqwest for the named service
    pub fn from_reqwest(service: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout {
                service: service.to_string(),
            }
        } else if err.is_decode() {
            UpstreamError::InvalidResponse {
                service: service.to_string(),
                message: err.to_string(),
            }
        } else {
            UpstreamError::Connection {
                service: service.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Classify a non-success HTTP status for the named service
    pub fn from_status(service: &str, resource: &str, status: u16, body: &str) -> Self {
        match status {
            404 | 410 => UpstreamError::NotFound {
                service: service.to_string(),
                resource: resource.to_string(),
            },
            408 => UpstreamError::Timeout {
                service: service.to_string(),
            },
            401 | 403 => UpstreamError::Unauthorized {
                service: service.to_string(),
                status,
                message: body.chars().take(200).collect(),
            },
            429 | 500..=599 => UpstreamError::Unavailable {
                service: service.to_string(),
                status,
            },
            _ => UpstreamError::Rejected {
                service: service.to_string(),
                status,
                message: body.chars().take(200).collect(),
            },
        }
    }
}

/// Lock store errors
#[derive(Debug, Error)]
pub enum LockError {
    /// The lease expired or was taken over by another holder
    #[error("lease on {key} lost (fence {fence})")]
    Lost {
        /// Namespaced lock key
        key: String,
        /// Fencing token of the lost lease
        fence: u64,
    },

    /// The backing store failed
    #[error("lock store failure: {0}")]
    Store(String),
}

/// Persistence errors, tagged with the write that failed
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Raw bytes could not be written to blob storage
    #[error("blob write {key} failed: {reason}")]
    Blob {
        /// Blob key
        key: String,
        /// Failure description
        reason: String,
    },

    /// Primary record write failed
    #[error("record write for {article_id} failed: {reason}")]
    Record {
        /// Article identifier
        article_id: String,
        /// Failure description
        reason: String,
    },

    /// Search index update failed after the primary record was written
    #[error("index update for {article_id} failed: {reason}")]
    Index {
        /// Article identifier
        article_id: String,
        /// Failure description
        reason: String,
    },

    /// A newer lease holder already wrote this article
    #[error("write for {article_id} superseded (fence {fence} < {current})")]
    Superseded {
        /// Article identifier
        article_id: String,
        /// Fence presented by this writer
        fence: u64,
        /// Fence already stored
        current: u64,
    },
}

/// Failure taxonomy used at the message handler boundary
///
/// Every failed transition is classified into exactly one kind; the kind alone
/// decides what happens to the queue message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Another worker holds the article lease; redeliver without penalty
    LockContention,
    /// Origin, enrichment or store timeout/unavailability; retry with backoff
    TransientUpstream,
    /// Origin not found or unprocessable content; dead-letter immediately
    PermanentContent,
    /// A non-critical stage failed; recorded on the article, processing continues
    DegradedStage,
    /// Blob/record/index write failed; always treated as transient
    PersistenceFailure,
    /// Lease renewal failed mid-job; another worker owns the article now
    LockLost,
    /// A newer lease holder already persisted the article
    Superseded,
    /// The job exceeded its overall deadline and was abandoned
    DeadlineExceeded,
}

impl ErrorKind {
    /// Stable name used in the `error_kind` log field and dead-letter reasons
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::TransientUpstream => "transient_upstream",
            ErrorKind::PermanentContent => "permanent_content",
            ErrorKind::DegradedStage => "degraded_stage",
            ErrorKind::PersistenceFailure => "persistence_failure",
            ErrorKind::LockLost => "lock_lost",
            ErrorKind::Superseded => "superseded",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
