//! Worker configuration pointing at a mock server and a temporary directory

use article_ingest::config::{
    AuthConfig, Config, OriginConfig, PersistenceConfig, QueueConfig, ServiceEndpoint,
    WorkerConfig,
};
use article_ingest::types::SourceKind;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::MockServer;

/// Endpoint under `server` at `/{prefix}`
pub fn endpoint(server: &MockServer, prefix: &str) -> ServiceEndpoint {
    ServiceEndpoint {
        base_url: format!("{}/{}", server.uri(), prefix),
        timeout: Duration::from_secs(5),
    }
}

/// Web origin under `server` at `/{prefix}`
pub fn origin(server: &MockServer, name: &str, prefix: &str) -> OriginConfig {
    OriginConfig {
        name: name.to_string(),
        kind: SourceKind::Web,
        base_url: format!("{}/{}", server.uri(), prefix),
        mime_type: "text/html".to_string(),
        timeout: Duration::from_secs(5),
    }
}

/// Fast-polling configuration with every service on `server`
///
/// The single origin is `publisher` at `/pages`.
pub fn test_config(server: &MockServer, dir: &TempDir) -> Config {
    let mut config = Config {
        origins: vec![origin(server, "publisher", "pages")],
        queue: QueueConfig {
            visibility_timeout: Duration::from_secs(60),
            wait_time: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        },
        worker: WorkerConfig {
            max_concurrent_jobs: 2,
            job_deadline: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
        },
        persistence: PersistenceConfig {
            database_path: dir.path().join("ingest.db"),
            blob_dir: dir.path().join("blobs"),
        },
        ..Config::default()
    };
    config.services.language = Some(endpoint(server, "language"));
    config.services.image_sizer = Some(endpoint(server, "images"));
    config.services.tagger = Some(endpoint(server, "tags"));
    config.services.auth = Some(AuthConfig {
        url: format!("{}/auth/login", server.uri()),
        service_id: "ingest".to_string(),
        password: "secret".to_string(),
        token_max_age: Duration::from_secs(3600),
        refresh_margin: Duration::from_secs(60),
    });
    config.lock.lease_ttl = Duration::from_secs(60);
    config
}
