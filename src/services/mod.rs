//! Black-box collaborator services
//!
//! The worker only needs a request/response contract from each service. The
//! capability traits here are what the enrichment stages depend on; the HTTP
//! implementations in [`http`] share one authenticated [`ServiceClient`].

use crate::config::ServiceEndpoint;
use crate::credentials::CredentialProvider;
use crate::error::{Error, Result, UpstreamError};
use crate::logging;
use crate::types::Tag;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

mod http;

pub use http::{HttpHtmlCleaner, HttpImageSizer, HttpLanguageService, HttpSearchIndex, HttpTagger};

/// Pixel dimensions of an image
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ImageSize {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Language detection and translation
#[async_trait]
pub trait LanguageService: Send + Sync {
    /// Detect the language of `text` (ISO 639-1 code)
    async fn detect(&self, text: &str) -> Result<String>;

    /// Translate `text` from `from` into `to`
    async fn translate(&self, text: &str, from: &str, to: &str) -> Result<String>;
}

/// Reduces publisher HTML to article body text
#[async_trait]
pub trait HtmlCleaner: Send + Sync {
    /// Clean `html`
    async fn clean(&self, html: &str) -> Result<String>;
}

/// Resolves image dimensions
#[async_trait]
pub trait ImageSizer: Send + Sync {
    /// Dimensions of the image at `url`
    async fn size(&self, url: &str) -> Result<ImageSize>;
}

/// Assigns topic tags
#[async_trait]
pub trait Tagger: Send + Sync {
    /// Tags for `text` written in `language`
    async fn tag(&self, text: &str, language: &str) -> Result<Vec<Tag>>;
}

/// Authenticated JSON client for one collaborator service
///
/// Every request carries the current credential and the delivery's request
/// id, and is bounded by the endpoint timeout. A refused credential is
/// reported to the provider and the call is tried once more with a new one.
/// Failures are classified into [`UpstreamError`].
#[derive(Clone)]
pub struct ServiceClient {
    name: String,
    base_url: url::Url,
    http: reqwest::Client,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl ServiceClient {
    /// Client for `endpoint`, named `name` in errors and logs
    pub fn new(
        name: impl Into<String>,
        endpoint: &ServiceEndpoint,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Result<Self> {
        let name = name.into();
        let mut base_url = url::Url::parse(&endpoint.base_url).map_err(|e| {
            Error::config(
                format!("services.{name}.base_url"),
                format!("invalid URL {}: {}", endpoint.base_url, e),
            )
        })?;
        // Url::join drops the last segment unless the base ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .build()?;

        Ok(Self {
            name,
            base_url,
            http,
            credentials,
        })
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve a path relative to the service base URL
    pub fn url(&self, path: &str) -> Result<url::Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Other(format!("invalid path {path} for {}: {}", self.name, e)))
    }

    /// POST `body` as JSON to `path` and decode the JSON response
    ///
    /// `resource` names what is being looked up, for not-found errors.
    pub async fn post_json<B, R>(&self, path: &str, resource: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        self.send_json(reqwest::Method::POST, path, resource, body)
            .await
    }

    /// Send `body` as JSON with `method` and decode the JSON response
    pub async fn send_json<B, R>(
        &self,
        method: reqwest::Method,
        path: &str,
        resource: &str,
        body: &B,
    ) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        self.execute(method, path, resource, body)
            .await?
            .json::<R>()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&self.name, e).into())
    }

    /// Send `body` as JSON with `method`, discarding any response body
    pub async fn send<B>(
        &self,
        method: reqwest::Method,
        path: &str,
        resource: &str,
        body: &B,
    ) -> Result<()>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.execute(method, path, resource, body).await?;
        Ok(())
    }

    /// GET `path` and hand back the successful response
    ///
    /// Used for origins, whose bodies are not necessarily JSON.
    pub async fn get(&self, path: &str, resource: &str) -> Result<reqwest::Response> {
        let request = self.http.get(self.url(path)?);
        self.dispatch(request, resource).await
    }

    async fn execute<B>(
        &self,
        method: reqwest::Method,
        path: &str,
        resource: &str,
        body: &B,
    ) -> Result<reqwest::Response>
    where
        B: Serialize + ?Sized + Sync,
    {
        let request = self.http.request(method, self.url(path)?).json(body);
        self.dispatch(request, resource).await
    }

    /// Send `request`, retrying once with a fresh token if the credential is refused
    async fn dispatch(
        &self,
        request: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<reqwest::Response> {
        let request = match logging::current_request_id() {
            Some(id) => request.header(logging::REQUEST_ID_HEADER, id),
            None => request,
        };

        let Some(provider) = &self.credentials else {
            return self.send_once(request, resource).await;
        };

        let retry = request.try_clone();
        let credential = provider.credential().await?;
        let first = request.header(
            reqwest::header::AUTHORIZATION,
            credential.authorization_header(),
        );
        match self.send_once(first, resource).await {
            Err(Error::Upstream(e)) if e.is_unauthorized() => {
                provider.invalidate(&credential).await;
                let Some(retry) = retry else {
                    return Err(e.into());
                };
                tracing::debug!(service = %self.name, "Credential refused, retrying with a new one");
                let fresh = provider.credential().await?;
                let retry = retry.header(
                    reqwest::header::AUTHORIZATION,
                    fresh.authorization_header(),
                );
                let outcome = self.send_once(retry, resource).await;
                if let Err(Error::Upstream(e)) = &outcome
                    && e.is_unauthorized()
                {
                    provider.invalidate(&fresh).await;
                }
                outcome
            }
            outcome => outcome,
        }
    }

    async fn send_once(
        &self,
        request: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(
                UpstreamError::from_status(&self.name, resource, status.as_u16(), &body).into(),
            );
        }
        Ok(response)
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
