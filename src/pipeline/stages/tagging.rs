use crate::pipeline::{EnrichmentStage, FailurePolicy, Field, FieldValue, StageError, StageOutput};
use crate::services::Tagger;
use crate::types::{EnrichedArticle, RawDocument, Tag};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Assigns topic tags to the cleaned text
pub struct TaggingStage {
    tagger: Arc<dyn Tagger>,
}

impl TaggingStage {
    /// Stage name
    pub const NAME: &'static str = "tagging";

    /// Stage backed by `tagger`
    pub fn new(tagger: Arc<dyn Tagger>) -> Self {
        Self { tagger }
    }
}

/// Highest score first, one entry per name, scores clamped to [0, 1]
fn normalize(tags: Vec<Tag>) -> Vec<Tag> {
    let mut tags: Vec<Tag> = tags
        .into_iter()
        .filter(|t| !t.name.trim().is_empty() && t.score.is_finite())
        .map(|t| Tag {
            name: t.name.trim().to_lowercase(),
            score: t.score.clamp(0.0, 1.0),
        })
        .collect();
    tags.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.name.cmp(&b.name)));

    let mut seen = HashSet::new();
    tags.retain(|t| seen.insert(t.name.clone()));
    tags
}

#[async_trait]
impl EnrichmentStage for TaggingStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn requires(&self) -> &[Field] {
        &[Field::Content, Field::Language]
    }

    fn produces(&self) -> &[Field] {
        &[Field::Tags]
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::Degrade
    }

    async fn run(
        &self,
        _raw: &RawDocument,
        article: &EnrichedArticle,
    ) -> Result<StageOutput, StageError> {
        let language = article
            .language
            .as_deref()
            .ok_or_else(|| StageError::Permanent("language not detected".into()))?;
        let tags = self.tagger.tag(&article.content, language).await?;
        Ok(StageOutput::empty().with(FieldValue::Tags(normalize(tags))))
    }
}
