//! Database layer for article-ingest
//!
//! One SQLite database holds every piece of shared worker state. Several
//! worker processes may open the same file; every cross-worker invariant is
//! enforced by a single atomic statement rather than by in-process locking.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`]: Database lifecycle, schema migrations
//! - [`queue`]: Durable message queue with visibility timeouts and receipts
//! - [`dead_letters`]: Dead-letter sink
//! - [`locks`]: Leased locks with fencing tokens
//! - [`cache`]: Advisory key/value cache with expiry
//! - [`articles`]: Primary article records (fenced, versioned upserts)
//! - [`search`]: Local search documents (fenced upserts)
//! - [`state`]: Runtime state (shutdown tracking)

use sqlx::{FromRow, sqlite::SqlitePool};

mod articles;
mod cache;
mod dead_letters;
mod locks;
mod migrations;
mod queue;
mod search;
mod state;

/// A message claimed by one receive call
#[derive(Debug, Clone, FromRow)]
pub struct QueueRow {
    /// Message id
    pub id: i64,
    /// JSON payload as enqueued
    pub payload: String,
    /// Counted delivery attempt (starts at 1)
    pub attempt: i64,
    /// Raw number of deliveries including this one
    pub receive_count: i64,
    /// Receipt proving this delivery's claim; changes on every delivery
    pub receipt: String,
}

/// Dead-lettered message
#[derive(Debug, Clone, FromRow)]
pub struct DeadLetterRow {
    /// Unique database ID
    pub id: i64,
    /// Id of the queue message that was removed
    pub message_id: i64,
    /// Article identifier
    pub article_id: String,
    /// Why the message was dead-lettered
    pub reason: String,
    /// Handler state reached before giving up
    pub last_state: String,
    /// Counted attempts made
    pub attempts: i64,
    /// Original payload for manual replay
    pub payload: String,
    /// Unix timestamp (ms) when the message was dead-lettered
    pub created_at: i64,
}

/// Current holder of a lock row
#[derive(Debug, Clone, FromRow)]
pub struct LockRow {
    /// Namespaced lock key
    pub key: String,
    /// Holder that acquired the current (or last) lease
    pub holder: String,
    /// Fencing token of the current (or last) lease
    pub fence: i64,
    /// Unix timestamp (ms) when the lease expires
    pub expires_at: i64,
}

/// Article row as stored (JSON columns still encoded)
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ArticleRow {
    pub(crate) article_id: String,
    pub(crate) blob_key: String,
    pub(crate) mime_type: String,
    pub(crate) source_origin: String,
    pub(crate) content_hash: String,
    pub(crate) content: String,
    pub(crate) language: Option<String>,
    pub(crate) translated_variants: String,
    pub(crate) images: String,
    pub(crate) tags: String,
    pub(crate) metadata: String,
    pub(crate) degradations: String,
    pub(crate) version: i64,
    pub(crate) indexed_version: Option<i64>,
    pub(crate) updated_at: i64,
}

/// Result of a fenced article upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArticleWrite {
    /// Stored version after the write
    pub version: i64,
    /// Whether the stored content changed
    pub changed: bool,
    /// Unix timestamp (ms) of the last content change
    pub updated_at: i64,
}

/// Current time as Unix milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert a duration to whole milliseconds for SQL arithmetic
pub(crate) fn duration_ms(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Database handle for article-ingest
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
