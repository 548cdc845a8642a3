//! Service credentials for outbound calls
//!
//! Every component that talks to a collaborator service receives an
//! `Arc<dyn CredentialProvider>` and asks it for a token per request. Refresh
//! is driven by inspecting the cached token's expiry; nothing mutates a shared
//! token behind the callers' backs.

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

/// A bearer token and its expiry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    /// Opaque token value
    pub token: String,
    /// Instant after which the token is rejected
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the token expires within `margin` from now (or already has)
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        self.expires_at - Utc::now() <= margin
    }

    /// Value for the `Authorization` header
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Supplies a currently-valid credential on demand
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return a token that is valid right now
    async fn credential(&self) -> Result<Credential>;

    /// Report that a service refused `credential`
    ///
    /// The next [`credential`](Self::credential) call must not hand out the
    /// same token. Providers that cannot mint a new one ignore this.
    async fn invalidate(&self, _credential: &Credential) {}
}

/// Fixed token, for local runs and tests
pub struct StaticCredentialProvider {
    credential: Credential,
}

impl StaticCredentialProvider {
    /// Provider that always returns `token`
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential {
                token: token.into(),
                expires_at: Utc::now() + chrono::Duration::days(36_500),
            },
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credential(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }
}

/// Mints new credentials
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Obtain a fresh token
    async fn issue(&self) -> Result<Credential>;
}

/// Caches a credential and refreshes it shortly before it expires
///
/// Concurrent callers that find the token stale wait on the same refresh.
pub struct RefreshingCredentialProvider {
    source: Box<dyn TokenSource>,
    refresh_margin: Duration,
    current: Mutex<Option<Credential>>,
}

impl RefreshingCredentialProvider {
    /// Wrap `source`, refreshing `refresh_margin` before expiry
    pub fn new(source: Box<dyn TokenSource>, refresh_margin: Duration) -> Self {
        Self {
            source,
            refresh_margin,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CredentialProvider for RefreshingCredentialProvider {
    async fn credential(&self) -> Result<Credential> {
        let mut current = self.current.lock().await;

        if let Some(credential) = current.as_ref()
            && !credential.expires_within(self.refresh_margin)
        {
            return Ok(credential.clone());
        }

        let fresh = self.source.issue().await?;
        tracing::info!(expires_at = %fresh.expires_at, "Refreshed service credential");
        *current = Some(fresh.clone());
        Ok(fresh)
    }

    async fn invalidate(&self, credential: &Credential) {
        let mut current = self.current.lock().await;
        // Another caller may already have replaced the refused token
        if current.as_ref().is_some_and(|c| c.token == credential.token) {
            tracing::warn!(
                expires_at = %credential.expires_at,
                "Service refused credential, discarding it"
            );
            *current = None;
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    service_id: &'a str,
    password: &'a str,
    max_token_age: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Logs in to the credential issuer with a service account
pub struct HttpTokenSource {
    client: reqwest::Client,
    url: String,
    service_id: String,
    password: String,
    max_age: Duration,
}

impl HttpTokenSource {
    /// Token source for the configured issuer
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            service_id: config.service_id.clone(),
            password: config.password.clone(),
            max_age: config.token_max_age,
        })
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn issue(&self) -> Result<Credential> {
        let request = LoginRequest {
            service_id: &self.service_id,
            password: &self.password,
            max_token_age: self.max_age.as_secs(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Credential(format!("login request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Credential(format!(
                "login rejected with HTTP {}",
                status.as_u16()
            )));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| Error::Credential(format!("invalid login response: {}", e)))?;

        let max_age = chrono::Duration::from_std(self.max_age)
            .map_err(|e| Error::Credential(format!("token max age out of range: {}", e)))?;

        Ok(Credential {
            token: body.token,
            expires_at: body.expires_at.unwrap_or_else(|| Utc::now() + max_age),
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingSource {
        issued: Arc<AtomicU32>,
        lifetime: chrono::Duration,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn issue(&self) -> Result<Credential> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Credential {
                token: format!("token-{n}"),
                expires_at: Utc::now() + self.lifetime,
            })
        }
    }

    #[tokio::test]
    async fn test_valid_token_is_reused() {
        let issued = Arc::new(AtomicU32::new(0));
        let provider = RefreshingCredentialProvider::new(
            Box::new(CountingSource {
                issued: issued.clone(),
                lifetime: chrono::Duration::hours(1),
            }),
            Duration::from_secs(300),
        );

        let first = provider.credential().await.unwrap();
        let second = provider.credential().await.unwrap();
        assert_eq!(first.token, "token-1");
        assert_eq!(second.token, "token-1");
        assert_eq!(issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_inside_refresh_margin_is_replaced() {
        let issued = Arc::new(AtomicU32::new(0));
        let provider = RefreshingCredentialProvider::new(
            Box::new(CountingSource {
                issued: issued.clone(),
                // Always inside the 5 minute margin
                lifetime: chrono::Duration::minutes(2),
            }),
            Duration::from_secs(300),
        );

        assert_eq!(provider.credential().await.unwrap().token, "token-1");
        assert_eq!(provider.credential().await.unwrap().token, "token-2");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let issued = Arc::new(AtomicU32::new(0));
        let provider = Arc::new(RefreshingCredentialProvider::new(
            Box::new(CountingSource {
                issued: issued.clone(),
                lifetime: chrono::Duration::hours(1),
            }),
            Duration::from_secs(300),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.credential().await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().token, "token-1");
        }
        assert_eq!(issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_token_is_replaced_on_next_call() {
        let issued = Arc::new(AtomicU32::new(0));
        let provider = RefreshingCredentialProvider::new(
            Box::new(CountingSource {
                issued: issued.clone(),
                lifetime: chrono::Duration::hours(1),
            }),
            Duration::from_secs(300),
        );

        let refused = provider.credential().await.unwrap();
        provider.invalidate(&refused).await;
        let fresh = provider.credential().await.unwrap();
        assert_eq!(fresh.token, "token-2");

        // A late report about the old token keeps the new one
        provider.invalidate(&refused).await;
        assert_eq!(provider.credential().await.unwrap().token, "token-2");
        assert_eq!(issued.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_static_provider_never_expires() {
        let provider = StaticCredentialProvider::new("fixed");
        let credential = provider.credential().await.unwrap();
        assert_eq!(credential.authorization_header(), "Bearer fixed");
        assert!(!credential.expires_within(Duration::from_secs(86_400 * 365)));
    }

    #[tokio::test]
    async fn test_http_source_logs_in_with_service_account() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .and(body_json(serde_json::json!({
                "serviceId": "ingest",
                "password": "secret",
                "maxTokenAge": 3600
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "jwt-abc"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpTokenSource::new(&AuthConfig {
            url: format!("{}/login", server.uri()),
            service_id: "ingest".into(),
            password: "secret".into(),
            token_max_age: Duration::from_secs(3600),
            refresh_margin: Duration::from_secs(300),
        })
        .unwrap();

        let credential = source.issue().await.unwrap();
        assert_eq!(credential.token, "jwt-abc");
        assert!(!credential.expires_within(Duration::from_secs(3000)));
        assert!(credential.expires_within(Duration::from_secs(3700)));
    }

    #[tokio::test]
    async fn test_http_source_reports_rejected_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let source = HttpTokenSource::new(&AuthConfig {
            url: server.uri(),
            service_id: "ingest".into(),
            password: "wrong".into(),
            token_max_age: Duration::from_secs(3600),
            refresh_margin: Duration::from_secs(300),
        })
        .unwrap();

        let err = source.issue().await.unwrap_err();
        assert!(matches!(err, Error::Credential(ref m) if m.contains("401")));
    }
}
