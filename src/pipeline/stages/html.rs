use super::is_html;
use crate::pipeline::{EnrichmentStage, FailurePolicy, Field, FieldValue, StageError, StageOutput};
use crate::services::HtmlCleaner;
use crate::types::{EnrichedArticle, RawDocument};
use async_trait::async_trait;
use std::sync::Arc;

/// Reduces publisher markup to body text
///
/// Non-HTML content passes through untouched. Degrades by default: the raw
/// body is still worth persisting when the cleaner is down.
pub struct HtmlCleaningStage {
    cleaner: Arc<dyn HtmlCleaner>,
}

impl HtmlCleaningStage {
    /// Stage name
    pub const NAME: &'static str = "html_cleaning";

    /// Stage backed by `cleaner`
    pub fn new(cleaner: Arc<dyn HtmlCleaner>) -> Self {
        Self { cleaner }
    }
}

#[async_trait]
impl EnrichmentStage for HtmlCleaningStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn requires(&self) -> &[Field] {
        &[Field::Content]
    }

    fn produces(&self) -> &[Field] {
        &[Field::Content]
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::Degrade
    }

    async fn run(
        &self,
        raw: &RawDocument,
        article: &EnrichedArticle,
    ) -> Result<StageOutput, StageError> {
        if !is_html(&raw.mime_type) {
            return Ok(StageOutput::empty());
        }

        let text = self.cleaner.clean(&article.content).await?;
        if text.trim().is_empty() {
            return Err(StageError::Permanent("cleaner returned no text".into()));
        }
        Ok(StageOutput::empty().with(FieldValue::Content(text)))
    }
}
