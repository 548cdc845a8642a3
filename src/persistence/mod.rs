//! Persistence across blob storage, the primary store and the search index
//!
//! [`PersistenceCoordinator::commit`] always writes in the same order:
//!
//! 1. raw bytes to blob storage, under a content-addressed key, so a retry is
//!    an identical overwrite
//! 2. the primary record, fenced by the lease token and versioned by content
//!    hash, so a replay of the same content changes nothing
//! 3. the search index, fenced the same way, after which the record is marked
//!    indexed at its version
//!
//! A crash between 1 and 2 leaves an orphan blob and no record; the job is
//! redelivered and overwrites both. A failure at 3 leaves a correct record
//! with a stale index, visible through [`Database::unindexed_articles`], and
//! the job is retried.
//!
//! [`Database::unindexed_articles`]: crate::db::Database::unindexed_articles

use crate::error::{Error, PersistenceError, Result};
use crate::types::{
    ArticleId, Degradation, EnrichedArticle, ImageRef, PersistedArticle, RawDocument, Tag,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

mod blob;
mod store;

pub use blob::{FsBlobStore, MemoryBlobStore};

/// Raw-bytes storage keyed by string
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any previous value
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    /// Read the bytes under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Primary article store
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Fenced, content-versioned upsert
    ///
    /// Fails with [`PersistenceError::Superseded`] when a newer lease holder
    /// already wrote this article.
    async fn upsert_article(&self, record: &ArticleRecord, fence: u64) -> Result<PersistedArticle>;

    /// Record that the search index reflects `version`
    async fn mark_indexed(&self, article_id: &ArticleId, version: i64) -> Result<()>;

    /// Load the stored record
    async fn load_article(&self, article_id: &ArticleId) -> Result<Option<PersistedArticle>>;
}

/// Derived-field search index
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Fenced upsert of the document for one article
    async fn upsert(&self, document: &SearchDocument) -> Result<()>;
}

/// Everything written to the primary store for one article
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ArticleRecord {
    /// Article identity
    pub article_id: ArticleId,
    /// Blob key of the raw bytes
    pub blob_key: String,
    /// MIME type of the raw bytes
    pub mime_type: String,
    /// Origin that served the raw content
    pub source_origin: String,
    /// Cleaned body
    pub content: String,
    /// Detected language
    pub language: Option<String>,
    /// Translations
    pub translated_variants: BTreeMap<String, String>,
    /// Images
    pub images: Vec<ImageRef>,
    /// Tags
    pub tags: Vec<Tag>,
    /// Metadata
    pub metadata: BTreeMap<String, String>,
    /// Degradation markers
    pub degradations: Vec<Degradation>,
}

impl ArticleRecord {
    /// Assemble the record for `enriched`, whose raw bytes live at `blob_key`
    pub fn new(raw: &RawDocument, enriched: &EnrichedArticle, blob_key: String) -> Self {
        Self {
            article_id: enriched.article_id.clone(),
            blob_key,
            mime_type: raw.mime_type.clone(),
            source_origin: raw.source_origin.clone(),
            content: enriched.content.clone(),
            language: enriched.language.clone(),
            translated_variants: enriched.translated_variants.clone(),
            images: enriched.images.clone(),
            tags: enriched.tags.clone(),
            metadata: enriched.metadata.clone(),
            degradations: enriched.degradations.clone(),
        }
    }

    /// SHA-256 over every stored field; equal hashes mean identical records
    pub fn content_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Document pushed to the search index
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    /// Article identity
    pub article_id: ArticleId,
    /// Lease token of the writer
    pub fence: u64,
    /// Primary record version this document reflects
    pub version: i64,
    /// Title from metadata
    pub title: Option<String>,
    /// Body text
    pub content: String,
    /// Language
    pub language: Option<String>,
    /// Tag names
    pub tags: Vec<String>,
}

impl SearchDocument {
    /// Derive the index document from a stored record
    pub fn from_article(article: &PersistedArticle, fence: u64) -> Self {
        Self {
            article_id: article.article_id.clone(),
            fence,
            version: article.version,
            title: article.metadata.get("title").cloned(),
            content: article.content.clone(),
            language: article.language.clone(),
            tags: article.tags.iter().map(|t| t.name.clone()).collect(),
        }
    }
}

/// Content-addressed blob key for a raw document
///
/// `raw/{articleId}/{sha256(body)}.{ext}` with the article id percent-encoded.
pub fn blob_key(raw: &RawDocument) -> String {
    let digest = hex::encode(Sha256::digest(raw.body.as_bytes()));
    format!(
        "raw/{}/{}.{}",
        urlencoding::encode(raw.article_id.as_str()),
        digest,
        extension_for(&raw.mime_type)
    )
}

fn extension_for(mime_type: &str) -> &'static str {
    let essence = mime_type.split(';').next().unwrap_or("").trim();
    match essence {
        "text/html" | "application/xhtml+xml" => "html",
        "application/json" => "json",
        "text/plain" => "txt",
        "application/xml" | "text/xml" | "application/rss+xml" | "application/atom+xml" => "xml",
        _ => "bin",
    }
}

/// Writes one article across the three stores in recoverable order
#[derive(Clone)]
pub struct PersistenceCoordinator {
    blobs: Arc<dyn BlobStore>,
    articles: Arc<dyn ArticleStore>,
    index: Arc<dyn SearchIndex>,
}

impl PersistenceCoordinator {
    /// Coordinator over the given stores
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        articles: Arc<dyn ArticleStore>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        Self {
            blobs,
            articles,
            index,
        }
    }

    /// Blob, then fenced record, then fenced index, then the indexed marker
    pub async fn commit(
        &self,
        raw: &RawDocument,
        enriched: &EnrichedArticle,
        fence: u64,
    ) -> Result<PersistedArticle> {
        let article_id = raw.article_id.to_string();
        let key = blob_key(raw);

        self.blobs
            .put(&key, raw.body.as_bytes(), &raw.mime_type)
            .await
            .map_err(|e| PersistenceError::Blob {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        let record = ArticleRecord::new(raw, enriched, key);
        let mut article = self
            .articles
            .upsert_article(&record, fence)
            .await
            .map_err(|e| stage_error(e, |reason| PersistenceError::Record {
                article_id: article_id.clone(),
                reason,
            }))?;

        let document = SearchDocument::from_article(&article, fence);
        self.index
            .upsert(&document)
            .await
            .map_err(|e| stage_error(e, |reason| PersistenceError::Index {
                article_id: article_id.clone(),
                reason,
            }))?;

        self.articles
            .mark_indexed(&article.article_id, article.version)
            .await
            .map_err(|e| stage_error(e, |reason| PersistenceError::Index {
                article_id: article_id.clone(),
                reason,
            }))?;
        article.indexed_version = Some(article.version);

        tracing::debug!(
            article_id = %article.article_id,
            version = article.version,
            fence,
            "Article committed"
        );
        Ok(article)
    }
}

/// Keep `Superseded` as-is; tag everything else with the failing write
fn stage_error(err: Error, wrap: impl FnOnce(String) -> PersistenceError) -> Error {
    match err {
        Error::Persistence(PersistenceError::Superseded { .. }) => err,
        other => Error::Persistence(wrap(other.to_string())),
    }
}
