use crate::pipeline::{EnrichmentStage, FailurePolicy, Field, FieldValue, StageError, StageOutput};
use crate::services::LanguageService;
use crate::types::{EnrichedArticle, RawDocument};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Detects the article language and translates into the target languages
///
/// Fails the job by default: tagging and search both key off the language.
pub struct LanguageStage {
    service: Arc<dyn LanguageService>,
    targets: Vec<String>,
}

impl LanguageStage {
    /// Stage name
    pub const NAME: &'static str = "language";

    /// Stage backed by `service`, translating into `targets`
    pub fn new(service: Arc<dyn LanguageService>, targets: Vec<String>) -> Self {
        let mut targets: Vec<String> = targets
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        targets.sort();
        targets.dedup();
        Self { service, targets }
    }
}

#[async_trait]
impl EnrichmentStage for LanguageStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn requires(&self) -> &[Field] {
        &[Field::Content]
    }

    fn produces(&self) -> &[Field] {
        &[Field::Language, Field::TranslatedVariants]
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::FailJob
    }

    async fn run(
        &self,
        _raw: &RawDocument,
        article: &EnrichedArticle,
    ) -> Result<StageOutput, StageError> {
        if article.content.trim().is_empty() {
            return Err(StageError::Permanent("no text to detect a language in".into()));
        }

        let language = self
            .service
            .detect(&article.content)
            .await?
            .trim()
            .to_lowercase();
        if language.is_empty() {
            return Err(StageError::Permanent("language service returned no language".into()));
        }

        let mut variants = BTreeMap::new();
        for target in self.targets.iter().filter(|t| **t != language) {
            let translated = self
                .service
                .translate(&article.content, &language, target)
                .await?;
            variants.insert(target.clone(), translated);
        }

        Ok(StageOutput::empty()
            .with(FieldValue::Language(language))
            .with(FieldValue::TranslatedVariants(variants)))
    }
}
