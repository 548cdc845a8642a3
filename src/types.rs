//! Core types for article-ingest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Identity of one logical article
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArticleId(pub String);

impl ArticleId {
    /// Create a new ArticleId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ArticleId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ArticleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ArticleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of content an origin serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Publisher web page (HTML)
    Web,
    /// Syndication feed entry (structured JSON)
    Syndicated,
}

impl SourceKind {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Web => "web",
            SourceKind::Syndicated => "syndicated",
        }
    }
}

/// Producer's hint about where the article content lives
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceHint {
    /// Prefer web origins
    Web,
    /// Prefer syndication origins
    Syndicated,
    /// Use the configured order as-is
    #[default]
    Unspecified,
}

impl SourceHint {
    /// The origin kind this hint moves to the front, if any
    pub fn preferred_kind(&self) -> Option<SourceKind> {
        match self {
            SourceHint::Web => Some(SourceKind::Web),
            SourceHint::Syndicated => Some(SourceKind::Syndicated),
            SourceHint::Unspecified => None,
        }
    }

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceHint::Web => "web",
            SourceHint::Syndicated => "syndicated",
            SourceHint::Unspecified => "unspecified",
        }
    }
}

/// Queue message payload as produced by the API layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    /// Article to process
    pub article_id: ArticleId,
    /// Where the content most likely lives
    #[serde(default)]
    pub source_hint: SourceHint,
    /// When the producer enqueued the message
    pub enqueue_time: DateTime<Utc>,
}

impl JobMessage {
    /// Message for `article_id` enqueued now
    pub fn new(article_id: impl Into<ArticleId>, source_hint: SourceHint) -> Self {
        Self {
            article_id: article_id.into(),
            source_hint,
            enqueue_time: Utc::now(),
        }
    }
}

/// One delivery of a queue message, immutable for the duration of the delivery
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    /// Article to process
    pub article_id: ArticleId,
    /// Where the content most likely lives
    pub source_hint: SourceHint,
    /// When the producer enqueued the message
    pub enqueue_time: DateTime<Utc>,
    /// Counted processing attempts, starting at 1 (lock contention does not count)
    pub delivery_attempt: u32,
    /// Raw deliveries of this message, counted or not
    pub receive_count: u32,
}

/// Normalized raw content fetched from an origin
#[derive(Clone, Debug, PartialEq)]
pub struct RawDocument {
    /// Article this content belongs to
    pub article_id: ArticleId,
    /// MIME essence of `body`: lowercase, without parameters
    pub mime_type: String,
    /// Raw content
    pub body: String,
    /// Name of the origin that served it
    pub source_origin: String,
    /// URL the content was fetched from (base for relative links)
    pub source_url: Option<String>,
    /// When it was fetched
    pub fetched_at: DateTime<Utc>,
}

/// `type/subtype` of a media type, lowercased and stripped of parameters
///
/// `Text/HTML; charset=utf-8` becomes `text/html`. Returns `None` for a blank
/// value.
pub fn mime_essence(media_type: &str) -> Option<String> {
    let essence = media_type.split(';').next()?.trim();
    (!essence.is_empty()).then(|| essence.to_ascii_lowercase())
}

/// An image referenced by the article
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Canonical absolute URL
    pub url: String,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// A topic tag assigned to the article
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag name
    pub name: String,
    /// Confidence in [0, 1]
    pub score: f32,
}

/// Marker recording that a stage's contribution is missing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degradation {
    /// Stage that did not contribute
    pub stage: String,
    /// Why
    pub reason: String,
}

/// Accumulator built by the enrichment pipeline for one processing attempt
#[derive(Clone, Debug, PartialEq, Default)]
pub struct EnrichedArticle {
    /// Article identity
    pub article_id: ArticleId,
    /// Body text; starts as the raw body and is replaced by cleaning
    pub content: String,
    /// Detected language code
    pub language: Option<String>,
    /// Translations keyed by language code
    pub translated_variants: BTreeMap<String, String>,
    /// Images kept after filtering
    pub images: Vec<ImageRef>,
    /// Assigned tags
    pub tags: Vec<Tag>,
    /// Extracted metadata (title, description, ...)
    pub metadata: BTreeMap<String, String>,
    /// Stages that did not contribute
    pub degradations: Vec<Degradation>,
}

impl EnrichedArticle {
    /// Start an accumulator from raw content
    pub fn from_raw(raw: &RawDocument) -> Self {
        Self {
            article_id: raw.article_id.clone(),
            content: raw.body.clone(),
            ..Default::default()
        }
    }

    /// Whether any stage was skipped
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

impl Default for ArticleId {
    fn default() -> Self {
        Self(String::new())
    }
}

/// The durable record of an article as stored in the primary store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedArticle {
    /// Article identity
    pub article_id: ArticleId,
    /// Key of the raw bytes in blob storage
    pub blob_key: String,
    /// MIME type of the raw bytes
    pub mime_type: String,
    /// Origin that served the raw content
    pub source_origin: String,
    /// SHA-256 of the persisted enrichment output
    pub content_hash: String,
    /// Cleaned body text
    pub content: String,
    /// Detected language
    pub language: Option<String>,
    /// Translations keyed by language code
    pub translated_variants: BTreeMap<String, String>,
    /// Images
    pub images: Vec<ImageRef>,
    /// Tags
    pub tags: Vec<Tag>,
    /// Metadata
    pub metadata: BTreeMap<String, String>,
    /// Degradation markers
    pub degradations: Vec<Degradation>,
    /// Incremented whenever the stored content changes
    pub version: i64,
    /// Version last pushed to the search index (None = never indexed)
    pub indexed_version: Option<i64>,
    /// When the stored content last changed
    pub updated_at: DateTime<Utc>,
}

impl PersistedArticle {
    /// Whether the search index lags behind the primary record
    pub fn index_is_stale(&self) -> bool {
        self.indexed_version != Some(self.version)
    }
}

/// States of the per-job state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    /// Message received, nothing done yet
    Received,
    /// Article lease held
    Locked,
    /// Raw content fetched
    Retrieved,
    /// Pipeline finished
    Enriched,
    /// Blob, record and index written
    Persisted,
    /// Message removed from the queue
    Acked,
    /// Message scheduled for redelivery
    Retry,
    /// Message moved to the dead-letter sink
    DeadLetter,
}

impl HandlerState {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerState::Received => "received",
            HandlerState::Locked => "locked",
            HandlerState::Retrieved => "retrieved",
            HandlerState::Enriched => "enriched",
            HandlerState::Persisted => "persisted",
            HandlerState::Acked => "acked",
            HandlerState::Retry => "retry",
            HandlerState::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker events broadcast to subscribers
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A delivery started processing
    JobStarted {
        /// Article id
        article_id: ArticleId,
        /// Counted attempt number
        attempt: u32,
    },

    /// The article was persisted and the message acknowledged
    JobCompleted {
        /// Article id
        article_id: ArticleId,
        /// Stored version
        version: i64,
        /// Whether any stage degraded
        degraded: bool,
    },

    /// The message was scheduled for redelivery
    JobRetried {
        /// Article id
        article_id: ArticleId,
        /// Redelivery delay
        delay: Duration,
        /// Whether this redelivery counts toward the attempt limit
        counted: bool,
    },

    /// The message was moved to the dead-letter sink
    JobDeadLettered {
        /// Article id
        article_id: ArticleId,
        /// Recorded reason
        reason: String,
    },

    /// The job hit its deadline or lost its lease and was left for redelivery
    JobAbandoned {
        /// Article id
        article_id: ArticleId,
    },

    /// A stage was skipped and its contribution is missing
    StageDegraded {
        /// Article id
        article_id: ArticleId,
        /// Stage name
        stage: String,
        /// Reason
        reason: String,
    },

    /// Worker stopped
    Shutdown,
}
