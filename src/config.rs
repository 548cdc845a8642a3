//! Configuration types for article-ingest

use crate::error::{Error, Result};
use crate::pipeline::FailurePolicy;
use crate::types::SourceKind;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

/// Main configuration for the ingestion worker
///
/// Every field has a default so a minimal file only needs `origins`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Service identity and key namespace
    #[serde(default)]
    pub service: ServiceConfig,

    /// Queue polling and redelivery settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pool settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Distributed lock settings
    #[serde(default)]
    pub lock: LockConfig,

    /// Retry/backoff settings for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Origin sources in priority order
    #[serde(default)]
    pub origins: Vec<OriginConfig>,

    /// Collaborator service endpoints
    #[serde(default)]
    pub services: ServicesConfig,

    /// Enrichment pipeline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Advisory cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Storage locations
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load a JSON configuration file and validate it
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| Error::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.origins.is_empty() {
            return Err(Error::config("origins", "at least one origin is required"));
        }
        for (i, origin) in self.origins.iter().enumerate() {
            if url::Url::parse(&origin.base_url).is_err() {
                return Err(Error::config(
                    format!("origins[{i}].base_url"),
                    format!("invalid URL: {}", origin.base_url),
                ));
            }
        }
        if self.worker.max_concurrent_jobs == 0 {
            return Err(Error::config(
                "worker.max_concurrent_jobs",
                "must be at least 1",
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(Error::config("queue.batch_size", "must be at least 1"));
        }
        if self.lock.lease_ttl < self.worker.job_deadline {
            return Err(Error::config(
                "lock.lease_ttl",
                "lease must outlive the job deadline",
            ));
        }
        if self.queue.visibility_timeout < self.worker.job_deadline {
            return Err(Error::config(
                "queue.visibility_timeout",
                "visibility timeout must outlive the job deadline",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

/// Service identity and key namespace
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Prefix for lock and cache keys (default: "article-ingest")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Lease holder identity (default: generated per process)
    #[serde(default)]
    pub holder_id: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            holder_id: None,
        }
    }
}

/// Queue polling and redelivery settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a received message stays invisible to other consumers (default: 300s)
    #[serde(default = "default_visibility_timeout", with = "duration_serde")]
    pub visibility_timeout: Duration,

    /// Upper bound on a single poll (default: 20s)
    #[serde(default = "default_wait_time", with = "duration_serde")]
    pub wait_time: Duration,

    /// Sleep between empty receives inside one poll (default: 500ms)
    #[serde(
        default = "default_poll_interval",
        rename = "poll_interval_ms",
        with = "duration_ms_serde"
    )]
    pub poll_interval: Duration,

    /// Messages claimed per receive (default: 1)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Redelivery delay when another worker holds the article lease (default: 5s)
    #[serde(default = "default_contention_delay", with = "duration_serde")]
    pub contention_delay: Duration,

    /// Minimum redelivery delay for retries; bounds replica lag (default: 2s)
    #[serde(default = "default_redelivery_delay", with = "duration_serde")]
    pub redelivery_delay: Duration,

    /// Hard ceiling on deliveries of one message, counted or not (default: 20)
    #[serde(default = "default_max_receives")]
    pub max_receives: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: default_visibility_timeout(),
            wait_time: default_wait_time(),
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
            contention_delay: default_contention_delay(),
            redelivery_delay: default_redelivery_delay(),
            max_receives: default_max_receives(),
        }
    }
}

/// Worker pool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Messages handled concurrently by one process (default: 4)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: usize,

    /// Overall bound on one job before it is abandoned (default: 240s)
    #[serde(default = "default_job_deadline", with = "duration_serde")]
    pub job_deadline: Duration,

    /// How long shutdown waits for in-flight jobs (default: 30s)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent(),
            job_deadline: default_job_deadline(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Distributed lock settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease duration; bounds unavailability after a crashed holder (default: 300s)
    #[serde(default = "default_lease_ttl", with = "duration_serde")]
    pub lease_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl: default_lease_ttl(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts before dead-lettering (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// One origin source
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Name used in logs and on the stored record
    pub name: String,

    /// Which kind of content this origin serves
    pub kind: SourceKind,

    /// Base URL; the article id is appended as a path segment
    pub base_url: String,

    /// MIME type of the returned body (default: text/html)
    #[serde(default = "default_mime_type")]
    pub mime_type: String,

    /// Request timeout (default: 15s)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

/// A collaborator service endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Base URL of the service
    pub base_url: String,

    /// Request timeout (default: 15s)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

/// Credential issuer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Login endpoint
    pub url: String,

    /// Service account id
    pub service_id: String,

    /// Service account password
    pub password: String,

    /// Requested token lifetime (default: 3600s)
    #[serde(default = "default_token_max_age", with = "duration_serde")]
    pub token_max_age: Duration,

    /// Refresh this long before expiry (default: 300s)
    #[serde(default = "default_refresh_margin", with = "duration_serde")]
    pub refresh_margin: Duration,
}

/// Collaborator service endpoints
///
/// Absent services leave their stage out of the pipeline.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Language detection and translation
    #[serde(default)]
    pub language: Option<ServiceEndpoint>,

    /// HTML cleaning
    #[serde(default)]
    pub html_cleaner: Option<ServiceEndpoint>,

    /// Image dimension lookup
    #[serde(default)]
    pub image_sizer: Option<ServiceEndpoint>,

    /// Article tagging
    #[serde(default)]
    pub tagger: Option<ServiceEndpoint>,

    /// External search index (default: local SQLite index)
    #[serde(default)]
    pub search_index: Option<ServiceEndpoint>,

    /// Credential issuer (default: unauthenticated calls)
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// Enrichment pipeline settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bound on a single stage call (default: 30s)
    #[serde(default = "default_stage_timeout", with = "duration_serde")]
    pub stage_timeout: Duration,

    /// Per-stage failure policy overrides, keyed by stage name
    #[serde(default)]
    pub stage_policies: HashMap<String, FailurePolicy>,

    /// Languages every article is translated into
    #[serde(default)]
    pub target_languages: Vec<String>,

    /// Images narrower than this are dropped (default: 200)
    #[serde(default = "default_min_image_width")]
    pub min_image_width: u32,

    /// Images shorter than this are dropped (default: 150)
    #[serde(default = "default_min_image_height")]
    pub min_image_height: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: default_stage_timeout(),
            stage_policies: HashMap::new(),
            target_languages: vec![],
            min_image_width: default_min_image_width(),
            min_image_height: default_min_image_height(),
        }
    }
}

/// Cache backend selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// Per-process map
    #[default]
    Memory,
    /// Shared SQLite table
    Sqlite,
    /// Shared Redis (requires the `redis` feature)
    Redis,
}

/// Advisory cache settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Backend (default: memory)
    #[serde(default)]
    pub backend: CacheBackend,

    /// Entry lifetime (default: 24h)
    #[serde(default = "default_cache_ttl", with = "duration_serde")]
    pub ttl: Duration,

    /// Capacity of the in-memory backend (default: 10000)
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,

    /// Redis URL for the redis backend and lock store
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            ttl: default_cache_ttl(),
            max_entries: default_cache_entries(),
            redis_url: None,
        }
    }
}

/// Storage locations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./article-ingest.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Root directory of the raw blob store (default: "./blobs")
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            blob_dir: default_blob_dir(),
        }
    }
}

/// Log output settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_prefix() -> String {
    "article-ingest".to_string()
}

fn default_visibility_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_wait_time() -> Duration {
    Duration::from_secs(20)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_batch_size() -> usize {
    1
}

fn default_contention_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_redelivery_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_receives() -> u32 {
    20
}

fn default_max_concurrent() -> usize {
    4
}

fn default_job_deadline() -> Duration {
    Duration::from_secs(240)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_mime_type() -> String {
    "text/html".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_token_max_age() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_refresh_margin() -> Duration {
    Duration::from_secs(300)
}

fn default_stage_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_min_image_width() -> u32 {
    200
}

fn default_min_image_height() -> u32 {
    150
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_cache_entries() -> usize {
    10_000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./article-ingest.db")
}

fn default_blob_dir() -> PathBuf {
    PathBuf::from("./blobs")
}

fn default_log_level() -> String {
    "info".to_string()
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond Duration serialization helper
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
