//! Raw content retrieval from prioritised origins
//!
//! An article can live at several origins (publisher pages, syndication
//! feeds). [`OriginRetriever`] tries them in a fixed order and stops at the
//! first success. How the remaining failures are classified decides the
//! fate of the job:
//!
//! - every origin answered "not found": permanent, the job is dead-lettered
//! - at least one origin timed out or was unreachable: transient, retried
//! - otherwise the last permanent error is returned

use crate::error::{Error, Result, UpstreamError};
use crate::retry::IsRetryable;
use crate::types::{ArticleId, RawDocument, SourceHint, SourceKind};
use async_trait::async_trait;
use std::sync::Arc;

mod http;

pub use http::HttpOriginSource;

/// One place raw article content can be fetched from
#[async_trait]
pub trait OriginSource: Send + Sync {
    /// Name recorded on the raw document and in logs
    fn name(&self) -> &str;

    /// Kind of content this origin serves
    fn kind(&self) -> SourceKind;

    /// Fetch and normalize the content for `article_id`
    async fn fetch(&self, article_id: &ArticleId) -> Result<RawDocument>;
}

/// Tries origins in priority order until one returns content
#[derive(Clone)]
pub struct OriginRetriever {
    origins: Vec<Arc<dyn OriginSource>>,
}

impl OriginRetriever {
    /// Retriever over `origins`, in configured priority order
    pub fn new(origins: Vec<Arc<dyn OriginSource>>) -> Self {
        Self { origins }
    }

    /// Number of configured origins
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    /// Whether no origin is configured
    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    /// Origins in the order they are tried for `hint`
    ///
    /// Origins of the hinted kind move to the front; relative order within
    /// each group is preserved.
    pub fn order_for(&self, hint: SourceHint) -> Vec<Arc<dyn OriginSource>> {
        let mut ordered = self.origins.clone();
        if let Some(preferred) = hint.preferred_kind() {
            // stable sort keeps configuration order inside each group
            ordered.sort_by_key(|origin| origin.kind() != preferred);
        }
        ordered
    }

    /// Fetch the raw document for `article_id`, first success wins
    pub async fn fetch(&self, article_id: &ArticleId, hint: SourceHint) -> Result<RawDocument> {
        let mut transient: Option<Error> = None;
        let mut permanent: Option<Error> = None;
        let mut not_found = 0usize;

        for origin in self.order_for(hint) {
            match origin.fetch(article_id).await {
                Ok(raw) => {
                    tracing::debug!(
                        article_id = %article_id,
                        origin = origin.name(),
                        mime_type = %raw.mime_type,
                        bytes = raw.body.len(),
                        "Fetched raw content"
                    );
                    return Ok(raw);
                }
                Err(e) if is_not_found(&e) => {
                    tracing::debug!(article_id = %article_id, origin = origin.name(), "Not found at origin");
                    not_found += 1;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        article_id = %article_id,
                        origin = origin.name(),
                        error = %e,
                        "Origin unavailable, trying next origin"
                    );
                    transient = Some(e);
                }
                Err(e) => {
                    tracing::warn!(
                        article_id = %article_id,
                        origin = origin.name(),
                        error = %e,
                        "Origin returned unusable content, trying next origin"
                    );
                    permanent = Some(e);
                }
            }
        }

        if let Some(e) = transient {
            return Err(e);
        }
        if let Some(e) = permanent {
            return Err(e);
        }
        tracing::debug!(article_id = %article_id, origins = not_found, "Not found at any origin");
        Err(UpstreamError::NotFound {
            service: "origins".to_string(),
            resource: article_id.to_string(),
        }
        .into())
    }
}

fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::Upstream(upstream) if upstream.is_not_found())
}

impl std::fmt::Debug for OriginRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.origins.iter().map(|o| o.name()).collect();
        f.debug_struct("OriginRetriever")
            .field("origins", &names)
            .finish()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
