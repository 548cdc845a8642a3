//! Log subscriber setup, shared field names and request correlation
//!
//! Every transition failure in the message handler is logged with the same
//! four fields so a single article can be followed across workers:
//! [`ARTICLE_ID`], [`ATTEMPT`], [`STATE`] and [`ERROR_KIND`].
//!
//! Each delivery also gets a request id. The worker runs the delivery inside
//! a `job` span carrying it and inside [`with_request_id`], so outbound
//! service calls send the same id in [`REQUEST_ID_HEADER`].

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Article identifier field
pub const ARTICLE_ID: &str = "article_id";
/// Counted delivery attempt field
pub const ATTEMPT: &str = "attempt";
/// Handler state field
pub const STATE: &str = "state";
/// Error taxonomy field
pub const ERROR_KIND: &str = "error_kind";
/// Per-delivery correlation id field
pub const REQUEST_ID: &str = "request_id";

/// Header carrying the correlation id on outbound calls
pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static CURRENT_REQUEST_ID: String;
}

/// Fresh correlation id for one delivery
pub fn new_request_id() -> String {
    format!("{:016x}", rand::thread_rng().r#gen::<u64>())
}

/// Run `future` with `request_id` as the current correlation id
pub async fn with_request_id<F: Future>(request_id: String, future: F) -> F::Output {
    CURRENT_REQUEST_ID.scope(request_id, future).await
}

/// Correlation id of the delivery being handled on this task, if any
pub fn current_request_id() -> Option<String> {
    CURRENT_REQUEST_ID.try_with(Clone::clone).ok()
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `config.level`. A second call leaves the
/// already-installed subscriber in place and returns `Ok(())`.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config("logging.level", format!("invalid filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
    Ok(())
}
