//! HTTP implementations of the collaborator service contracts

use super::{HtmlCleaner, ImageSize, ImageSizer, LanguageService, ServiceClient, Tagger};
use crate::error::Result;
use crate::persistence::{SearchDocument, SearchIndex};
use crate::types::Tag;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct DetectResponse {
    language: String,
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    from: &'a str,
    to: &'a str,
}

#[derive(Deserialize)]
struct TextResponse {
    text: String,
}

/// Language detection and translation over HTTP
///
/// `POST detect {text} -> {language}`, `POST translate {text, from, to} -> {text}`
#[derive(Debug, Clone)]
pub struct HttpLanguageService {
    client: ServiceClient,
}

impl HttpLanguageService {
    /// Wrap a configured client
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LanguageService for HttpLanguageService {
    async fn detect(&self, text: &str) -> Result<String> {
        let response: DetectResponse = self
            .client
            .post_json("detect", "language", &TextRequest { text })
            .await?;
        Ok(response.language)
    }

    async fn translate(&self, text: &str, from: &str, to: &str) -> Result<String> {
        let response: TextResponse = self
            .client
            .post_json("translate", to, &TranslateRequest { text, from, to })
            .await?;
        Ok(response.text)
    }
}

#[derive(Serialize)]
struct CleanRequest<'a> {
    html: &'a str,
}

/// HTML cleaning over HTTP: `POST clean {html} -> {text}`
#[derive(Debug, Clone)]
pub struct HttpHtmlCleaner {
    client: ServiceClient,
}

impl HttpHtmlCleaner {
    /// Wrap a configured client
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HtmlCleaner for HttpHtmlCleaner {
    async fn clean(&self, html: &str) -> Result<String> {
        let response: TextResponse = self
            .client
            .post_json("clean", "document", &CleanRequest { html })
            .await?;
        Ok(response.text)
    }
}

#[derive(Serialize)]
struct SizeRequest<'a> {
    url: &'a str,
}

/// Image dimension lookup over HTTP: `POST size {url} -> {width, height}`
#[derive(Debug, Clone)]
pub struct HttpImageSizer {
    client: ServiceClient,
}

impl HttpImageSizer {
    /// Wrap a configured client
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageSizer for HttpImageSizer {
    async fn size(&self, url: &str) -> Result<ImageSize> {
        self.client.post_json("size", url, &SizeRequest { url }).await
    }
}

#[derive(Serialize)]
struct TagRequest<'a> {
    text: &'a str,
    language: &'a str,
}

#[derive(Deserialize)]
struct TagResponse {
    tags: Vec<Tag>,
}

/// Tagging over HTTP: `POST tag {text, language} -> {tags: [{name, score}]}`
#[derive(Debug, Clone)]
pub struct HttpTagger {
    client: ServiceClient,
}

impl HttpTagger {
    /// Wrap a configured client
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tagger for HttpTagger {
    async fn tag(&self, text: &str, language: &str) -> Result<Vec<Tag>> {
        let response: TagResponse = self
            .client
            .post_json("tag", "tags", &TagRequest { text, language })
            .await?;
        Ok(response.tags)
    }
}

/// External search index: `PUT documents/{articleId}` with the document body
///
/// The index is expected to ignore documents whose fence is lower than the
/// one it already holds.
#[derive(Debug, Clone)]
pub struct HttpSearchIndex {
    client: ServiceClient,
}

impl HttpSearchIndex {
    /// Wrap a configured client
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn upsert(&self, document: &SearchDocument) -> Result<()> {
        let path = format!(
            "documents/{}",
            urlencoding::encode(document.article_id.as_str())
        );
        self.client
            .send(
                reqwest::Method::PUT,
                &path,
                document.article_id.as_str(),
                document,
            )
            .await
    }
}
