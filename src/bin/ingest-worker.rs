//! Article ingestion worker process
//!
//! Usage: `ingest-worker [CONFIG]`. The configuration path falls back to
//! `INGEST_CONFIG`, then `ingest.json`. A `.env` file is loaded first if
//! present.

use article_ingest::{Config, Worker, logging, run_with_shutdown};
use std::path::PathBuf;

const CONFIG_ENV: &str = "INGEST_CONFIG";
const DEFAULT_CONFIG: &str = "ingest.json";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = Config::from_file(&path)?;
    logging::init(&config.logging)?;
    tracing::info!(config = %path.display(), "Starting ingest worker");

    let worker = Worker::from_config(config).await?;
    let polling = worker.start();

    run_with_shutdown(worker).await?;
    polling.await?;
    Ok(())
}
