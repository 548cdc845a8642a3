use super::*;
use crate::config::OriginConfig;
use crate::credentials::StaticCredentialProvider;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Scripted origin outcome
#[derive(Clone, Copy)]
enum Script {
    Serve,
    NotFound,
    TimeOut,
    Reject,
}

struct FakeOrigin {
    name: &'static str,
    kind: SourceKind,
    script: Script,
    calls: AtomicUsize,
}

impl FakeOrigin {
    fn new(name: &'static str, kind: SourceKind, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            script,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginSource for FakeOrigin {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, article_id: &ArticleId) -> Result<RawDocument> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Serve => Ok(RawDocument {
                article_id: article_id.clone(),
                mime_type: "text/html".into(),
                body: format!("<p>from {}</p>", self.name),
                source_origin: self.name.to_string(),
                source_url: None,
                fetched_at: Utc::now(),
            }),
            Script::NotFound => Err(UpstreamError::NotFound {
                service: self.name.to_string(),
                resource: article_id.to_string(),
            }
            .into()),
            Script::TimeOut => Err(UpstreamError::Timeout {
                service: self.name.to_string(),
            }
            .into()),
            Script::Reject => Err(UpstreamError::Rejected {
                service: self.name.to_string(),
                status: 422,
                message: "unprocessable".into(),
            }
            .into()),
        }
    }
}

fn retriever(origins: &[Arc<FakeOrigin>]) -> OriginRetriever {
    OriginRetriever::new(
        origins
            .iter()
            .map(|o| o.clone() as Arc<dyn OriginSource>)
            .collect(),
    )
}

#[tokio::test]
async fn test_first_success_wins() {
    let first = FakeOrigin::new("primary", SourceKind::Web, Script::Serve);
    let second = FakeOrigin::new("mirror", SourceKind::Web, Script::Serve);

    let raw = retriever(&[first.clone(), second.clone()])
        .fetch(&"A1".into(), SourceHint::Unspecified)
        .await
        .unwrap();

    assert_eq!(raw.source_origin, "primary");
    assert_eq!(second.calls(), 0);
}

#[tokio::test]
async fn test_timeout_falls_back_to_next_origin() {
    let first = FakeOrigin::new("primary", SourceKind::Web, Script::TimeOut);
    let second = FakeOrigin::new("mirror", SourceKind::Web, Script::Serve);

    let raw = retriever(&[first.clone(), second])
        .fetch(&"A1".into(), SourceHint::Unspecified)
        .await
        .unwrap();

    assert_eq!(raw.source_origin, "mirror");
    assert_eq!(raw.body, "<p>from mirror</p>");
    assert_eq!(first.calls(), 1);
}

#[tokio::test]
async fn test_not_found_everywhere_is_permanent() {
    let origins = [
        FakeOrigin::new("primary", SourceKind::Web, Script::NotFound),
        FakeOrigin::new("feed", SourceKind::Syndicated, Script::NotFound),
    ];

    let err = retriever(&origins)
        .fetch(&"A1".into(), SourceHint::Unspecified)
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    assert!(is_not_found(&err));
    assert!(origins.iter().all(|o| o.calls() == 1));
}

#[tokio::test]
async fn test_any_transient_failure_makes_exhaustion_transient() {
    let origins = [
        FakeOrigin::new("primary", SourceKind::Web, Script::NotFound),
        FakeOrigin::new("mirror", SourceKind::Web, Script::TimeOut),
        FakeOrigin::new("feed", SourceKind::Syndicated, Script::Reject),
    ];

    let err = retriever(&origins)
        .fetch(&"A1".into(), SourceHint::Unspecified)
        .await
        .unwrap_err();

    assert!(err.is_retryable(), "{err}");
}

#[tokio::test]
async fn test_rejected_content_without_transient_failures_is_permanent() {
    let origins = [
        FakeOrigin::new("primary", SourceKind::Web, Script::NotFound),
        FakeOrigin::new("feed", SourceKind::Syndicated, Script::Reject),
    ];

    let err = retriever(&origins)
        .fetch(&"A1".into(), SourceHint::Unspecified)
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    assert!(!is_not_found(&err));
}

#[test]
fn test_hint_moves_matching_kind_to_front() {
    let origins = [
        FakeOrigin::new("web-a", SourceKind::Web, Script::Serve),
        FakeOrigin::new("feed-a", SourceKind::Syndicated, Script::Serve),
        FakeOrigin::new("web-b", SourceKind::Web, Script::Serve),
        FakeOrigin::new("feed-b", SourceKind::Syndicated, Script::Serve),
    ];
    let retriever = retriever(&origins);

    let names = |hint| {
        retriever
            .order_for(hint)
            .iter()
            .map(|o| o.name().to_string())
            .collect::<Vec<_>>()
    };

    assert_eq!(
        names(SourceHint::Syndicated),
        ["feed-a", "feed-b", "web-a", "web-b"]
    );
    assert_eq!(names(SourceHint::Web), ["web-a", "web-b", "feed-a", "feed-b"]);
    assert_eq!(
        names(SourceHint::Unspecified),
        ["web-a", "feed-a", "web-b", "feed-b"]
    );
}

fn origin_config(server: &MockServer, name: &str, kind: SourceKind, prefix: &str) -> OriginConfig {
    OriginConfig {
        name: name.into(),
        kind,
        base_url: format!("{}/{}", server.uri(), prefix),
        mime_type: "text/html".into(),
        timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_http_web_origin_returns_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pages/A1"))
        .and(header("authorization", "Bearer origin-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<html><p>hi</p></html>", "text/html; charset=utf-8"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let origin = HttpOriginSource::new(
        &origin_config(&server, "publisher", SourceKind::Web, "pages"),
        Some(Arc::new(StaticCredentialProvider::new("origin-token"))),
    )
    .unwrap();
    let raw = origin.fetch(&"A1".into()).await.unwrap();

    assert_eq!(raw.article_id, ArticleId::from("A1"));
    assert_eq!(raw.mime_type, "text/html");
    assert_eq!(raw.body, "<html><p>hi</p></html>");
    assert_eq!(raw.source_origin, "publisher");
    assert_eq!(
        raw.source_url.as_deref(),
        Some(format!("{}/pages/A1", server.uri()).as_str())
    );
}

#[tokio::test]
async fn test_http_syndicated_origin_unwraps_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed/A1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "content": "<p>syndicated</p>",
            "link": "https://news.example.com/a1"
        })))
        .mount(&server)
        .await;

    let origin = HttpOriginSource::new(
        &origin_config(&server, "feed", SourceKind::Syndicated, "feed"),
        None,
    )
    .unwrap();
    let raw = origin.fetch(&"A1".into()).await.unwrap();

    assert_eq!(raw.body, "<p>syndicated</p>");
    assert_eq!(raw.mime_type, "text/html");
    assert_eq!(raw.source_url.as_deref(), Some("https://news.example.com/a1"));
}

#[tokio::test]
async fn test_http_syndicated_entry_mime_type_is_reduced_to_its_essence() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed/A2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "content": "<p>syndicated</p>",
            "mimeType": "Text/HTML; charset=utf-8"
        })))
        .mount(&server)
        .await;

    let origin = HttpOriginSource::new(
        &origin_config(&server, "feed", SourceKind::Syndicated, "feed"),
        None,
    )
    .unwrap();
    let raw = origin.fetch(&"A2".into()).await.unwrap();

    assert_eq!(raw.mime_type, "text/html");
}

#[tokio::test]
async fn test_http_origin_classifies_missing_and_broken_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed/broken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"title": "x"})))
        .mount(&server)
        .await;

    let origin = HttpOriginSource::new(
        &origin_config(&server, "feed", SourceKind::Syndicated, "feed"),
        None,
    )
    .unwrap();

    let missing = origin.fetch(&"gone".into()).await.unwrap_err();
    assert!(is_not_found(&missing));

    let broken = origin.fetch(&"broken".into()).await.unwrap_err();
    assert!(!broken.is_retryable());
    assert!(!is_not_found(&broken));
}
