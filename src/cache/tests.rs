use super::*;
use crate::db::Database;
use crate::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Backend that fails every call
struct BrokenCache;

#[async_trait]
impl Cache for BrokenCache {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::Other("cache down".into()))
    }

    async fn put(&self, _key: &str, _value: &str) -> Result<()> {
        Err(Error::Other("cache down".into()))
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Err(Error::Other("cache down".into()))
    }
}

#[test]
fn test_fingerprint_is_stable_and_unambiguous() {
    assert_eq!(fingerprint(&["a", "b"]), fingerprint(&["a", "b"]));
    assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
    assert_eq!(fingerprint(&["x"]).len(), 64);
}

#[test]
fn test_key_namespace() {
    let cache = ReadThroughCache::new(Arc::new(MemoryCache::new(10, Duration::from_secs(60))), "ingest");
    assert_eq!(cache.key("abc"), "ingest:cache:abc");
}

#[tokio::test]
async fn test_read_through_computes_once() {
    let cache = ReadThroughCache::new(
        Arc::new(MemoryCache::new(100, Duration::from_secs(60))),
        "ingest",
    );
    let calls = AtomicUsize::new(0);
    let counter = &calls;

    for _ in 0..3 {
        let value: (u32, u32) = cache
            .get_or_compute(&["image-size", "https://img.example/a.png"], || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok((640, 480))
            })
            .await
            .unwrap();
        assert_eq!(value, (640, 480));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_broken_backend_never_changes_result() {
    let cache = ReadThroughCache::new(Arc::new(BrokenCache), "ingest");
    let calls = AtomicUsize::new(0);
    let counter = &calls;

    for _ in 0..2 {
        let value: String = cache
            .get_or_compute(&["k"], || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("computed".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "computed");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_compute_error_is_returned_and_not_cached() {
    let cache = ReadThroughCache::new(
        Arc::new(MemoryCache::new(100, Duration::from_secs(60))),
        "ingest",
    );

    let result: Result<u32> = cache
        .get_or_compute(&["k"], || async { Err(Error::Other("sizer down".into())) })
        .await;
    assert!(result.is_err());

    let value: u32 = cache
        .get_or_compute(&["k"], || async { Ok(7) })
        .await
        .unwrap();
    assert_eq!(value, 7);
}

#[tokio::test]
async fn test_undecodable_entry_is_recomputed() {
    let backend = Arc::new(MemoryCache::new(100, Duration::from_secs(60)));
    let cache = ReadThroughCache::new(backend.clone(), "ingest");
    backend
        .put(&cache.key(&fingerprint(&["k"])), "not json")
        .await
        .unwrap();

    let value: u32 = cache
        .get_or_compute(&["k"], || async { Ok(3) })
        .await
        .unwrap();
    assert_eq!(value, 3);
}

#[tokio::test]
async fn test_invalidate_forces_recompute() {
    let cache = ReadThroughCache::new(
        Arc::new(MemoryCache::new(100, Duration::from_secs(60))),
        "ingest",
    );

    let _: u32 = cache.get_or_compute(&["k"], || async { Ok(1) }).await.unwrap();
    cache.invalidate(&["k"]).await.unwrap();
    let value: u32 = cache.get_or_compute(&["k"], || async { Ok(2) }).await.unwrap();
    assert_eq!(value, 2);
}

#[tokio::test]
async fn test_memory_cache_expires_entries() {
    let cache = MemoryCache::new(100, Duration::from_millis(20));
    cache.put("k", "v").await.unwrap();
    assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    assert_eq!(cache.entry_count().await, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_sqlite_cache_shared_between_handles() {
    let file = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(file.path()).await.unwrap());
    let first = SqliteCache::new(db.clone(), Duration::from_secs(60));
    let second = SqliteCache::new(db, Duration::from_secs(60));

    first.put("ingest:cache:k", "v").await.unwrap();
    assert_eq!(
        second.get("ingest:cache:k").await.unwrap().as_deref(),
        Some("v")
    );
    second.remove("ingest:cache:k").await.unwrap();
    assert_eq!(first.get("ingest:cache:k").await.unwrap(), None);
    assert_eq!(first.purge_expired().await.unwrap(), 0);
}
