//! Enrichment pipeline
//!
//! A pipeline is an ordered list of [`EnrichmentStage`]s. Each stage declares
//! which article fields it reads and which it writes, and returns its writes
//! as a [`StageOutput`] instead of mutating the article. The pipeline applies
//! the output, which lets it enforce that a stage only touches the fields it
//! declared.
//!
//! Dependencies are checked when the pipeline is built: a stage may only
//! require fields produced by an earlier stage (or `content`, which every
//! article starts with). At run time a required field can still be missing
//! when its producer degraded; the dependent stage is then skipped and
//! recorded as degraded too.
//!
//! What a failure means is decided per stage by its [`FailurePolicy`]:
//!
//! - [`FailurePolicy::Degrade`]: record a [`Degradation`] and continue
//! - [`FailurePolicy::FailJob`]: stop; transient failures retry the job,
//!   permanent ones dead-letter it

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::retry::IsRetryable;
use crate::types::{Degradation, EnrichedArticle, ImageRef, RawDocument, Tag};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod stages;

pub use stages::{HtmlCleaningStage, ImageStage, LanguageStage, MetadataStage, TaggingStage};

/// What a stage failure does to the job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The job cannot complete without this stage
    FailJob,
    /// Record a degradation marker and continue without the stage's fields
    Degrade,
}

/// Article fields a stage can read or write
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    /// Body text
    Content,
    /// Detected language
    Language,
    /// Translations
    TranslatedVariants,
    /// Filtered images
    Images,
    /// Topic tags
    Tags,
    /// Extracted metadata
    Metadata,
}

impl Field {
    /// Field name as used in degradation reasons and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Content => "content",
            Field::Language => "language",
            Field::TranslatedVariants => "translated_variants",
            Field::Images => "images",
            Field::Tags => "tags",
            Field::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value for one article field
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Replaces the body text
    Content(String),
    /// Sets the language
    Language(String),
    /// Replaces the translations
    TranslatedVariants(BTreeMap<String, String>),
    /// Replaces the images
    Images(Vec<ImageRef>),
    /// Replaces the tags
    Tags(Vec<Tag>),
    /// Replaces the metadata
    Metadata(BTreeMap<String, String>),
}

impl FieldValue {
    /// The field this value is for
    pub fn field(&self) -> Field {
        match self {
            FieldValue::Content(_) => Field::Content,
            FieldValue::Language(_) => Field::Language,
            FieldValue::TranslatedVariants(_) => Field::TranslatedVariants,
            FieldValue::Images(_) => Field::Images,
            FieldValue::Tags(_) => Field::Tags,
            FieldValue::Metadata(_) => Field::Metadata,
        }
    }

    fn apply(self, article: &mut EnrichedArticle) {
        match self {
            FieldValue::Content(content) => article.content = content,
            FieldValue::Language(language) => article.language = Some(language),
            FieldValue::TranslatedVariants(variants) => article.translated_variants = variants,
            FieldValue::Images(images) => article.images = images,
            FieldValue::Tags(tags) => article.tags = tags,
            FieldValue::Metadata(metadata) => article.metadata = metadata,
        }
    }
}

/// Field writes returned by one stage run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StageOutput {
    values: Vec<FieldValue>,
}

impl StageOutput {
    /// Output that writes nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a field write
    pub fn with(mut self, value: FieldValue) -> Self {
        self.values.push(value);
        self
    }

    /// Fields written
    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.values.iter().map(FieldValue::field)
    }

    /// Whether nothing is written
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Failure of one stage run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Could succeed on a later attempt (timeout, service unavailable)
    #[error("{0}")]
    Transient(String),

    /// Will fail the same way again (unprocessable content, broken contract)
    #[error("{0}")]
    Permanent(String),
}

impl StageError {
    /// Whether a later attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }
}

impl From<Error> for StageError {
    fn from(err: Error) -> Self {
        if err.is_retryable() {
            StageError::Transient(err.to_string())
        } else {
            StageError::Permanent(err.to_string())
        }
    }
}

/// One enrichment concern (language, cleaning, images, tags, metadata)
#[async_trait]
pub trait EnrichmentStage: Send + Sync {
    /// Stable name used in configuration, logs and degradation markers
    fn name(&self) -> &str;

    /// Fields that must be present before this stage can run
    fn requires(&self) -> &[Field];

    /// Fields this stage may write
    fn produces(&self) -> &[Field];

    /// Policy applied when configuration does not override it
    fn default_policy(&self) -> FailurePolicy;

    /// Compute this stage's field writes
    async fn run(
        &self,
        raw: &RawDocument,
        article: &EnrichedArticle,
    ) -> std::result::Result<StageOutput, StageError>;
}

/// The stage that stopped a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stage {stage} failed: {error}")]
pub struct PipelineError {
    /// Stage name
    pub stage: String,
    /// Its failure
    pub error: StageError,
}

impl PipelineError {
    /// Whether retrying the job could get past this stage
    pub fn is_transient(&self) -> bool {
        self.error.is_transient()
    }
}

#[derive(Clone)]
struct ConfiguredStage {
    stage: Arc<dyn EnrichmentStage>,
    policy: FailurePolicy,
}

/// Ordered, validated set of stages
#[derive(Clone)]
pub struct EnrichmentPipeline {
    stages: Vec<ConfiguredStage>,
    stage_timeout: Duration,
}

impl EnrichmentPipeline {
    /// Build a pipeline running `stages` in the given order
    ///
    /// Fails when a stage requires a field no earlier stage produces, or when
    /// two stages produce the same field or share a name.
    pub fn new(stages: Vec<Arc<dyn EnrichmentStage>>, config: &PipelineConfig) -> Result<Self> {
        let mut available: HashSet<Field> = HashSet::from([Field::Content]);
        let mut owners: BTreeMap<Field, String> = BTreeMap::new();
        let mut names: HashSet<String> = HashSet::new();

        for stage in &stages {
            let name = stage.name().to_string();
            if !names.insert(name.clone()) {
                return Err(Error::config(
                    "pipeline.stages",
                    format!("stage {name} appears twice"),
                ));
            }
            for field in stage.requires() {
                if !available.contains(field) {
                    return Err(Error::config(
                        "pipeline.stages",
                        format!("stage {name} requires {field}, which no earlier stage produces"),
                    ));
                }
            }
            for field in stage.produces() {
                if let Some(owner) = owners.insert(*field, name.clone()) {
                    return Err(Error::config(
                        "pipeline.stages",
                        format!("{field} is produced by both {owner} and {name}"),
                    ));
                }
                available.insert(*field);
            }
        }

        for name in config.stage_policies.keys() {
            if !names.contains(name) {
                // Stages drop out when their service is not configured
                tracing::warn!(stage = %name, "Failure policy set for a stage that is not in the pipeline");
            }
        }

        let stages = stages
            .into_iter()
            .map(|stage| {
                let policy = config
                    .stage_policies
                    .get(stage.name())
                    .copied()
                    .unwrap_or_else(|| stage.default_policy());
                ConfiguredStage { stage, policy }
            })
            .collect();

        Ok(Self {
            stages,
            stage_timeout: config.stage_timeout,
        })
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.stage.name()).collect()
    }

    /// Effective policy of the named stage
    pub fn policy_of(&self, name: &str) -> Option<FailurePolicy> {
        self.stages
            .iter()
            .find(|s| s.stage.name() == name)
            .map(|s| s.policy)
    }

    /// Run every stage over `raw`
    ///
    /// Degraded stages are listed in the returned article's `degradations`.
    pub async fn run(
        &self,
        raw: &RawDocument,
    ) -> std::result::Result<EnrichedArticle, PipelineError> {
        let mut article = EnrichedArticle::from_raw(raw);
        let mut available: HashSet<Field> = HashSet::from([Field::Content]);

        for configured in &self.stages {
            let stage = &configured.stage;

            if let Some(missing) = stage.requires().iter().find(|f| !available.contains(*f)) {
                let reason = format!("skipped: {missing} unavailable");
                tracing::info!(
                    article_id = %article.article_id,
                    stage = stage.name(),
                    reason = %reason,
                    "Stage skipped"
                );
                article.degradations.push(Degradation {
                    stage: stage.name().to_string(),
                    reason,
                });
                continue;
            }

            let started = std::time::Instant::now();
            match self.run_stage(stage.as_ref(), raw, &article).await {
                Ok(output) => {
                    for value in output.values {
                        available.insert(value.field());
                        value.apply(&mut article);
                    }
                    tracing::debug!(
                        article_id = %article.article_id,
                        stage = stage.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Stage completed"
                    );
                }
                Err(error) if configured.policy == FailurePolicy::Degrade => {
                    tracing::warn!(
                        article_id = %article.article_id,
                        stage = stage.name(),
                        error = %error,
                        "Stage degraded"
                    );
                    article.degradations.push(Degradation {
                        stage: stage.name().to_string(),
                        reason: error.to_string(),
                    });
                }
                Err(error) => {
                    return Err(PipelineError {
                        stage: stage.name().to_string(),
                        error,
                    });
                }
            }
        }

        Ok(article)
    }

    /// One bounded stage call with its output checked against its declaration
    async fn run_stage(
        &self,
        stage: &dyn EnrichmentStage,
        raw: &RawDocument,
        article: &EnrichedArticle,
    ) -> std::result::Result<StageOutput, StageError> {
        let output = tokio::time::timeout(self.stage_timeout, stage.run(raw, article))
            .await
            .map_err(|_| {
                StageError::Transient(format!("timed out after {:?}", self.stage_timeout))
            })??;

        if let Some(field) = output.fields().find(|f| !stage.produces().contains(f)) {
            return Err(StageError::Permanent(format!(
                "wrote undeclared field {field}"
            )));
        }
        Ok(output)
    }
}

impl std::fmt::Debug for EnrichmentPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentPipeline")
            .field("stages", &self.stage_names())
            .field("stage_timeout", &self.stage_timeout)
            .finish()
    }
}
