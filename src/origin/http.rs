//! HTTP origins
//!
//! `GET {base_url}/{article_id}`. Web origins return the page itself.
//! Syndicated origins return a JSON entry whose `content` (or `html`, or
//! `body`) field carries the article markup; it is unwrapped here so every
//! origin hands the pipeline the same raw-document shape.

use super::OriginSource;
use crate::config::{OriginConfig, ServiceEndpoint};
use crate::credentials::CredentialProvider;
use crate::error::{Result, UpstreamError};
use crate::services::ServiceClient;
use crate::types::{ArticleId, RawDocument, SourceKind, mime_essence};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

/// Origin reachable over HTTP
#[derive(Debug, Clone)]
pub struct HttpOriginSource {
    kind: SourceKind,
    default_mime_type: String,
    client: ServiceClient,
}

/// Syndication entry as served by feed origins
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyndicatedEntry {
    #[serde(alias = "html", alias = "body")]
    content: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default, alias = "link")]
    url: Option<String>,
}

impl HttpOriginSource {
    /// Origin described by `config`
    pub fn new(
        config: &OriginConfig,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Result<Self> {
        let endpoint = ServiceEndpoint {
            base_url: config.base_url.clone(),
            timeout: config.timeout,
        };
        Ok(Self {
            kind: config.kind,
            default_mime_type: mime_essence(&config.mime_type)
                .unwrap_or_else(|| "text/html".to_string()),
            client: ServiceClient::new(config.name.clone(), &endpoint, credentials)?,
        })
    }

    fn normalize(
        &self,
        article_id: &ArticleId,
        url: String,
        mime_type: String,
        body: String,
    ) -> Result<RawDocument> {
        let mut raw = RawDocument {
            article_id: article_id.clone(),
            mime_type,
            body,
            source_origin: self.client.name().to_string(),
            source_url: Some(url),
            fetched_at: Utc::now(),
        };

        if self.kind == SourceKind::Syndicated && raw.mime_type.ends_with("json") {
            let entry: SyndicatedEntry =
                serde_json::from_str(&raw.body).map_err(|e| UpstreamError::InvalidResponse {
                    service: self.client.name().to_string(),
                    message: format!("syndicated entry for {}: {}", article_id, e),
                })?;
            raw.body = entry.content;
            raw.mime_type = entry
                .mime_type
                .as_deref()
                .and_then(mime_essence)
                .unwrap_or_else(|| "text/html".to_string());
            if entry.url.is_some() {
                raw.source_url = entry.url;
            }
        }
        Ok(raw)
    }
}

#[async_trait]
impl OriginSource for HttpOriginSource {
    fn name(&self) -> &str {
        self.client.name()
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, article_id: &ArticleId) -> Result<RawDocument> {
        let path = urlencoding::encode(article_id.as_str()).into_owned();
        let response = self.client.get(&path, article_id.as_str()).await?;

        let url = response.url().to_string();
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(mime_essence)
            .unwrap_or_else(|| self.default_mime_type.clone());
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::from_reqwest(self.client.name(), e))?;

        self.normalize(article_id, url, mime_type, body)
    }
}
