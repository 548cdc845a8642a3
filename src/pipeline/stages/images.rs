use super::{decode_entities, is_html, pattern};
use crate::cache::ReadThroughCache;
use crate::error::Result;
use crate::pipeline::{EnrichmentStage, FailurePolicy, Field, FieldValue, StageError, StageOutput};
use crate::retry::IsRetryable;
use crate::services::{ImageSize, ImageSizer};
use crate::types::{EnrichedArticle, ImageRef, RawDocument};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use url::Url;

/// Concurrent dimension lookups per article
const SIZE_LOOKUPS_IN_FLIGHT: usize = 4;

/// Extracts images from the raw markup, sizes them and drops small ones
///
/// Dimensions are looked up in the cache first and only then asked of the
/// sizer, which is the authoritative source; a sizer answer is written back
/// to the cache. An image the sizer does not know is dropped, while an
/// unavailable sizer fails the stage.
pub struct ImageStage {
    sizer: Arc<dyn ImageSizer>,
    cache: ReadThroughCache,
    min_width: u32,
    min_height: u32,
    img_tag: Regex,
    src_attr: Regex,
}

impl ImageStage {
    /// Stage name
    pub const NAME: &'static str = "images";

    /// Stage sizing through `cache` then `sizer`, keeping images of at least
    /// `min_width` x `min_height`
    pub fn new(
        sizer: Arc<dyn ImageSizer>,
        cache: ReadThroughCache,
        min_width: u32,
        min_height: u32,
    ) -> Result<Self> {
        Ok(Self {
            sizer,
            cache,
            min_width,
            min_height,
            img_tag: pattern(r"<img\b[^>]*>")?,
            src_attr: pattern(r#"\s(?:data-)?src\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
        })
    }

    /// Canonical absolute image URLs in document order, without duplicates
    pub fn extract_urls(&self, html: &str, base: Option<&str>) -> Vec<String> {
        let base = base.and_then(|b| Url::parse(b).ok());
        let mut seen = HashSet::new();
        let mut urls = Vec::new();

        for tag in self.img_tag.find_iter(html) {
            // `src` wins over `data-src` when both are present
            let mut candidates: Vec<(bool, String)> = self
                .src_attr
                .captures_iter(tag.as_str())
                .filter_map(|caps| {
                    let lazy = caps.get(0)?.as_str().to_ascii_lowercase().contains("data-src");
                    let value = caps.get(1).or_else(|| caps.get(2))?.as_str();
                    Some((lazy, decode_entities(value.trim())))
                })
                .collect();
            candidates.sort_by_key(|(lazy, _)| *lazy);

            let Some(url) = candidates
                .into_iter()
                .find_map(|(_, src)| canonicalize(&src, base.as_ref()))
            else {
                continue;
            };
            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }
        urls
    }

    async fn size_of(&self, url: &str) -> Result<ImageSize> {
        self.cache
            .get_or_compute(&["image-size", url], || self.sizer.size(url))
            .await
    }

    fn large_enough(&self, size: &ImageSize) -> bool {
        size.width >= self.min_width && size.height >= self.min_height
    }
}

/// Absolute http(s) URL without fragment, resolved against `base`
fn canonicalize(src: &str, base: Option<&Url>) -> Option<String> {
    if src.is_empty() || src.starts_with("data:") {
        return None;
    }
    let mut url = match Url::parse(src) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(src).ok()?,
        Err(_) => return None,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.into())
}

#[async_trait]
impl EnrichmentStage for ImageStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn requires(&self) -> &[Field] {
        &[]
    }

    fn produces(&self) -> &[Field] {
        &[Field::Images]
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::Degrade
    }

    async fn run(
        &self,
        raw: &RawDocument,
        article: &EnrichedArticle,
    ) -> std::result::Result<StageOutput, StageError> {
        if !is_html(&raw.mime_type) {
            return Ok(StageOutput::empty().with(FieldValue::Images(Vec::new())));
        }

        let urls = self.extract_urls(&raw.body, raw.source_url.as_deref());
        let mut sized: Vec<(String, Result<ImageSize>)> = Vec::with_capacity(urls.len());
        for batch in urls.chunks(SIZE_LOOKUPS_IN_FLIGHT) {
            let sizes = futures::future::join_all(batch.iter().map(|url| self.size_of(url))).await;
            sized.extend(batch.iter().cloned().zip(sizes));
        }

        let mut images = Vec::new();
        for (url, size) in sized {
            match size {
                Ok(size) if self.large_enough(&size) => images.push(ImageRef {
                    url,
                    width: size.width,
                    height: size.height,
                }),
                Ok(size) => {
                    tracing::trace!(article_id = %article.article_id, url = %url, ?size, "Image below minimum size");
                }
                Err(e) if e.is_retryable() => return Err(StageError::from(e)),
                Err(e) => {
                    tracing::debug!(article_id = %article.article_id, url = %url, error = %e, "Dropping unsizable image");
                }
            }
        }

        Ok(StageOutput::empty().with(FieldValue::Images(images)))
    }
}
