//! Article pages and collaborator service mocks

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Publisher page with three large images and one icon
pub const ARTICLE_PAGE: &str = r#"<html><head>
<title>Harbour reopens after repairs</title>
<meta name="description" content="The old harbour reopened on Monday.">
<meta name="author" content="Port Desk">
<link rel="canonical" href="https://news.example.com/harbour">
</head><body>
<p>The harbour reopened on Monday after two years of repairs.</p>
<img src="https://cdn.example.com/quay.jpg">
<img src="https://cdn.example.com/cranes.jpg">
<img src="https://cdn.example.com/ferry.jpg">
<img src="https://cdn.example.com/icon.png">
</body></html>"#;

/// Large images on [`ARTICLE_PAGE`]
pub const LARGE_IMAGES: [&str; 3] = [
    "https://cdn.example.com/quay.jpg",
    "https://cdn.example.com/cranes.jpg",
    "https://cdn.example.com/ferry.jpg",
];

/// Small image on [`ARTICLE_PAGE`], dropped by the size filter
pub const ICON: &str = "https://cdn.example.com/icon.png";

/// Serve `body` as HTML at `/{prefix}/{article_id}`
pub async fn mount_page(server: &MockServer, prefix: &str, article_id: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/{prefix}/{article_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html"))
        .mount(server)
        .await;
}

/// Answer `/{prefix}/{article_id}` with a bare status code
pub async fn mount_status(server: &MockServer, prefix: &str, article_id: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(format!("/{prefix}/{article_id}")))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Refuse the credential on `/{prefix}/{article_id}` once, as an expired token
/// would be; mount before the page so the refusal is matched first
pub async fn mount_refusal_once(server: &MockServer, prefix: &str, article_id: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/{prefix}/{article_id}")))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

/// Credential issuer handing out a long-lived token
pub async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "svc-token",
            "expiresAt": "2099-01-01T00:00:00Z"
        })))
        .mount(server)
        .await;
}

/// Language service detecting English
pub async fn mount_language(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/language/detect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"language": "EN"})))
        .mount(server)
        .await;
}

/// Image sizer: large images 800x600, the icon 16x16
pub async fn mount_image_sizer(server: &MockServer) {
    for url in LARGE_IMAGES {
        Mock::given(method("POST"))
            .and(path("/images/size"))
            .and(body_partial_json(json!({"url": url})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"width": 800, "height": 600})),
            )
            .mount(server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/images/size"))
        .and(body_partial_json(json!({"url": ICON})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"width": 16, "height": 16})))
        .mount(server)
        .await;
}

/// Tagger returning two tags
pub async fn mount_tagger(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/tags/tag"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tags": [
                {"name": "Shipping", "score": 0.7},
                {"name": "harbour", "score": 0.9}
            ]
        })))
        .mount(server)
        .await;
}

/// Tagger that is down
pub async fn mount_broken_tagger(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/tags/tag"))
        .respond_with(ResponseTemplate::new(503))
        .mount(server)
        .await;
}
