use super::*;
use crate::credentials::StaticCredentialProvider;
use crate::persistence::{SearchDocument, SearchIndex};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint(server: &MockServer) -> ServiceEndpoint {
    ServiceEndpoint {
        base_url: format!("{}/v1", server.uri()),
        timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_requests_carry_bearer_token_and_resolve_under_base_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/detect"))
        .and(header("authorization", "Bearer svc-token"))
        .and(body_json(serde_json::json!({"text": "hello world"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"language": "en"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ServiceClient::new(
        "language",
        &endpoint(&server),
        Some(Arc::new(StaticCredentialProvider::new("svc-token"))),
    )
    .unwrap();
    let service = HttpLanguageService::new(client);

    assert_eq!(service.detect("hello world").await.unwrap(), "en");
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/tag"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let tagger = HttpTagger::new(ServiceClient::new("tagger", &endpoint(&server), None).unwrap());
    let err = tagger.tag("text", "en").await.unwrap_err();
    match err {
        Error::Upstream(upstream) => {
            assert!(upstream.is_transient());
            assert!(upstream.to_string().contains("tagger"));
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_slow_service_times_out_as_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/clean"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"text": "late"}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let client = ServiceClient::new(
        "html_cleaner",
        &ServiceEndpoint {
            base_url: format!("{}/v1", server.uri()),
            timeout: Duration::from_millis(50),
        },
        None,
    )
    .unwrap();
    let err = HttpHtmlCleaner::new(client)
        .clean("<p>x</p>")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Upstream(ref e) if e.is_transient()));
}

#[tokio::test]
async fn test_image_not_found_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/size"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let sizer = HttpImageSizer::new(ServiceClient::new("image_sizer", &endpoint(&server), None).unwrap());
    let err = sizer.size("https://cdn.example.com/a.jpg").await.unwrap_err();
    assert!(matches!(err, Error::Upstream(ref e) if e.is_not_found()));
}

#[tokio::test]
async fn test_malformed_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/size"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let sizer = HttpImageSizer::new(ServiceClient::new("image_sizer", &endpoint(&server), None).unwrap());
    let err = sizer.size("https://cdn.example.com/a.jpg").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Upstream(UpstreamError::InvalidResponse { .. })
    ));
}

#[tokio::test]
async fn test_translate_and_tag_decode_responses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/translate"))
        .and(body_json(serde_json::json!({"text": "hola", "from": "es", "to": "en"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"text": "hello"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/tag"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "tags": [{"name": "politics", "score": 0.9}, {"name": "europe", "score": 0.4}]
        })))
        .mount(&server)
        .await;

    let language =
        HttpLanguageService::new(ServiceClient::new("language", &endpoint(&server), None).unwrap());
    assert_eq!(language.translate("hola", "es", "en").await.unwrap(), "hello");

    let tagger = HttpTagger::new(ServiceClient::new("tagger", &endpoint(&server), None).unwrap());
    let tags = tagger.tag("text", "en").await.unwrap();
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[0].name, "politics");
}

#[tokio::test]
async fn test_search_index_puts_document_by_article_id() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/documents/A%2F1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let index = HttpSearchIndex::new(ServiceClient::new("search_index", &endpoint(&server), None).unwrap());
    let document = SearchDocument {
        article_id: "A/1".into(),
        fence: 3,
        version: 1,
        title: Some("Title".into()),
        content: "body".into(),
        language: Some("en".into()),
        tags: vec!["politics".into()],
    };
    index.upsert(&document).await.unwrap();
}

#[test]
fn test_invalid_base_url_is_a_config_error() {
    let err = ServiceClient::new(
        "tagger",
        &ServiceEndpoint {
            base_url: "not a url".into(),
            timeout: Duration::from_secs(1),
        },
        None,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Config { key: Some(ref k), .. } if k == "services.tagger.base_url"));
}

/// Issues `token-1`, `token-2`, ... each valid for an hour
struct SequentialTokens(std::sync::atomic::AtomicU32);

#[async_trait]
impl crate::credentials::TokenSource for SequentialTokens {
    async fn issue(&self) -> Result<crate::credentials::Credential> {
        let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        Ok(crate::credentials::Credential {
            token: format!("token-{n}"),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        })
    }
}

fn refreshing_provider() -> Arc<dyn CredentialProvider> {
    Arc::new(crate::credentials::RefreshingCredentialProvider::new(
        Box::new(SequentialTokens(std::sync::atomic::AtomicU32::new(0))),
        Duration::from_secs(60),
    ))
}

#[tokio::test]
async fn test_refused_credential_is_replaced_and_call_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/detect"))
        .and(header("authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/detect"))
        .and(header("authorization", "Bearer token-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"language": "en"})))
        .expect(1)
        .mount(&server)
        .await;

    let provider = refreshing_provider();
    let service = HttpLanguageService::new(
        ServiceClient::new("language", &endpoint(&server), Some(provider.clone())).unwrap(),
    );

    assert_eq!(service.detect("hello").await.unwrap(), "en");
    assert_eq!(provider.credential().await.unwrap().token, "token-2");
}

#[tokio::test]
async fn test_credential_refused_twice_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/tag"))
        .respond_with(ResponseTemplate::new(403).set_body_string("revoked"))
        .expect(2)
        .mount(&server)
        .await;

    let tagger = HttpTagger::new(
        ServiceClient::new("tagger", &endpoint(&server), Some(refreshing_provider())).unwrap(),
    );
    let err = tagger.tag("text", "en").await.unwrap_err();
    match err {
        Error::Upstream(upstream) => {
            assert!(upstream.is_unauthorized());
            assert!(upstream.is_transient());
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_request_id_is_forwarded_as_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/detect"))
        .and(header("x-request-id", "req-0042"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"language": "de"})))
        .expect(1)
        .mount(&server)
        .await;

    let service = HttpLanguageService::new(
        ServiceClient::new("language", &endpoint(&server), None).unwrap(),
    );
    let language = logging::with_request_id("req-0042".into(), service.detect("hallo"))
        .await
        .unwrap();

    assert_eq!(language, "de");
}
