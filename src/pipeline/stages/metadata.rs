use super::{decode_entities, is_html, pattern};
use crate::error::Result;
use crate::pipeline::{EnrichmentStage, FailurePolicy, Field, FieldValue, StageError, StageOutput};
use crate::types::{EnrichedArticle, RawDocument};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

/// `<meta name=...>` entries worth keeping
const NAMED_META: &[&str] = &["description", "author", "keywords"];

/// Local extraction of title, description, canonical URL and Open Graph fields
///
/// Keys: `title`, `description`, `author`, `keywords`, `canonical_url`, and
/// every `og:*` / `article:*` property as-is.
pub struct MetadataStage {
    title: Regex,
    meta_tag: Regex,
    link_tag: Regex,
    attribute: Regex,
}

impl MetadataStage {
    /// Stage name
    pub const NAME: &'static str = "metadata";

    /// Compile the extractors
    pub fn new() -> Result<Self> {
        Ok(Self {
            title: pattern(r"(?s)<title\b[^>]*>(.*?)</title>")?,
            meta_tag: pattern(r"<meta\b[^>]*>")?,
            link_tag: pattern(r"<link\b[^>]*>")?,
            attribute: pattern(r#"([a-z_:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
        })
    }

    fn attributes(&self, tag: &str) -> HashMap<String, String> {
        self.attribute
            .captures_iter(tag)
            .filter_map(|caps| {
                let name = caps.get(1)?.as_str().to_ascii_lowercase();
                let value = caps.get(2).or_else(|| caps.get(3))?.as_str();
                Some((name, value.to_string()))
            })
            .collect()
    }

    /// Metadata found in `html`
    pub fn extract(&self, html: &str) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();

        if let Some(title) = self.title.captures(html).and_then(|c| c.get(1)) {
            insert_clean(&mut metadata, "title", title.as_str());
        }

        for tag in self.meta_tag.find_iter(html) {
            let attrs = self.attributes(tag.as_str());
            let Some(content) = attrs.get("content") else {
                continue;
            };
            if let Some(property) = attrs.get("property") {
                let property = property.to_ascii_lowercase();
                if property.starts_with("og:") || property.starts_with("article:") {
                    insert_clean(&mut metadata, &property, content);
                }
            } else if let Some(name) = attrs.get("name") {
                let name = name.to_ascii_lowercase();
                if NAMED_META.contains(&name.as_str()) {
                    insert_clean(&mut metadata, &name, content);
                }
            }
        }

        for tag in self.link_tag.find_iter(html) {
            let attrs = self.attributes(tag.as_str());
            let canonical = attrs
                .get("rel")
                .is_some_and(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("canonical")));
            if let (true, Some(href)) = (canonical, attrs.get("href")) {
                insert_clean(&mut metadata, "canonical_url", href);
                break;
            }
        }

        for (fallback, key) in [("og:title", "title"), ("og:description", "description")] {
            if !metadata.contains_key(key) {
                if let Some(value) = metadata.get(fallback).cloned() {
                    metadata.insert(key.to_string(), value);
                }
            }
        }
        metadata
    }
}

/// First value wins; entities decoded and whitespace collapsed
fn insert_clean(metadata: &mut BTreeMap<String, String>, key: &str, value: &str) {
    let value = decode_entities(value)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if !value.is_empty() {
        metadata.entry(key.to_string()).or_insert(value);
    }
}

#[async_trait]
impl EnrichmentStage for MetadataStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn requires(&self) -> &[Field] {
        &[]
    }

    fn produces(&self) -> &[Field] {
        &[Field::Metadata]
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::Degrade
    }

    async fn run(
        &self,
        raw: &RawDocument,
        _article: &EnrichedArticle,
    ) -> std::result::Result<StageOutput, StageError> {
        let metadata = if is_html(&raw.mime_type) {
            self.extract(&raw.body)
        } else {
            BTreeMap::new()
        };
        Ok(StageOutput::empty().with(FieldValue::Metadata(metadata)))
    }
}
