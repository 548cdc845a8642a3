//! Property tests for the lease invariant: however many workers race for the
//! same article, at most one holds a live lease, and every successful
//! acquisition gets a larger fencing token than the one before it.

use article_ingest::lock::{LockOutcome, MemoryLockStore};
use article_ingest::{ArticleId, Database, DistributedLock, LockStore};
use futures::future::join_all;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(60);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

/// Race `workers` holders for each of `articles` keys; count winners per key
async fn race(store: Arc<dyn LockStore>, workers: usize, articles: usize) -> HashMap<String, usize> {
    let attempts = (0..workers).flat_map(|w| {
        let store = store.clone();
        (0..articles).map(move |a| {
            let lock = DistributedLock::new(store.clone(), "prop", format!("worker-{w}"), TTL);
            tokio::spawn(async move {
                let id = ArticleId::from(format!("article-{a}").as_str());
                (id.to_string(), lock.acquire(&id).await.unwrap())
            })
        })
    });

    let mut winners: HashMap<String, usize> = HashMap::new();
    for result in join_all(attempts).await {
        let (id, outcome) = result.unwrap();
        let entry = winners.entry(id).or_default();
        if matches!(outcome, LockOutcome::Acquired(_)) {
            *entry += 1;
        }
    }
    winners
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_memory_store_grants_one_lease_per_article(workers in 2usize..12, articles in 1usize..4) {
        let winners = runtime().block_on(race(Arc::new(MemoryLockStore::new()), workers, articles));

        prop_assert_eq!(winners.len(), articles);
        for (id, count) in winners {
            prop_assert_eq!(count, 1, "article {} had {} live leases", id, count);
        }
    }

    #[test]
    fn test_fences_increase_across_handovers(holders in proptest::collection::vec(0usize..4, 1..20)) {
        let fences = runtime().block_on(async {
            let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
            let id = ArticleId::from("A1");
            let mut fences = Vec::new();
            for holder in holders {
                let lock = DistributedLock::new(store.clone(), "prop", format!("worker-{holder}"), TTL);
                if let LockOutcome::Acquired(lease) = lock.acquire(&id).await.unwrap() {
                    fences.push(lease.fence);
                    lock.release(&lease).await.unwrap();
                }
            }
            fences
        });

        prop_assert!(!fences.is_empty());
        prop_assert!(fences.windows(2).all(|w| w[0] < w[1]), "{:?}", fences);
    }
}

proptest! {
    // Each case opens a fresh database file
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_sqlite_store_grants_one_lease_per_article(workers in 2usize..8, articles in 1usize..3) {
        let winners = runtime().block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let db = Database::new(&dir.path().join("locks.db")).await.unwrap();
            race(Arc::new(db), workers, articles).await
        });

        prop_assert_eq!(winners.len(), articles);
        for (id, count) in winners {
            prop_assert_eq!(count, 1, "article {} had {} live leases", id, count);
        }
    }
}
