//! Queue helpers and event waits

use article_ingest::queue::SqliteMessageQueue;
use article_ingest::{Database, Event, JobMessage, MessageQueue, SourceHint};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Open the worker's database as a producer would
pub async fn open_database(path: &Path) -> Arc<Database> {
    Arc::new(Database::new(path).await.expect("open database"))
}

/// Enqueue a job for `article_id`
pub async fn enqueue(db: &Arc<Database>, article_id: &str) {
    SqliteMessageQueue::new(db.clone())
        .enqueue(&JobMessage::new(article_id, SourceHint::Web), Duration::ZERO)
        .await
        .expect("enqueue");
}

/// Receive events until one matches `predicate`, or `None` on timeout
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut predicate: impl FnMut(&Event) -> bool,
) -> Option<Event> {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Collect every event up to and including the first that matches `stop`
pub async fn collect_events_until(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut stop: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let done = stop(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    seen
}
