use super::temp_db;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(30);

#[tokio::test]
async fn test_acquire_starts_fence_at_one() {
    let (db, _file) = temp_db().await;

    let (fence, expires_at) = db
        .try_acquire_lock("ingest:lock:a-1", "worker-a", TTL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fence, 1);

    let row = db.lock_row("ingest:lock:a-1").await.unwrap().unwrap();
    assert_eq!(row.holder, "worker-a");
    assert_eq!(row.fence, 1);
    assert_eq!(row.expires_at, expires_at);

    db.close().await;
}

#[tokio::test]
async fn test_live_lease_blocks_every_holder() {
    let (db, _file) = temp_db().await;
    db.try_acquire_lock("k", "worker-a", TTL).await.unwrap().unwrap();

    assert!(db.try_acquire_lock("k", "worker-b", TTL).await.unwrap().is_none());
    assert!(
        db.try_acquire_lock("k", "worker-a", TTL).await.unwrap().is_none(),
        "re-acquire by the same holder is also refused"
    );

    db.close().await;
}

#[tokio::test]
async fn test_release_then_reacquire_bumps_fence() {
    let (db, _file) = temp_db().await;
    let (first, _) = db.try_acquire_lock("k", "worker-a", TTL).await.unwrap().unwrap();

    assert!(db.release_lock("k", first).await.unwrap());
    // Releasing twice is a no-op
    assert!(!db.release_lock("k", first).await.unwrap());

    let (second, _) = db.try_acquire_lock("k", "worker-b", TTL).await.unwrap().unwrap();
    assert_eq!(second, first + 1);

    db.close().await;
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let (db, _file) = temp_db().await;
    let (first, _) = db
        .try_acquire_lock("k", "worker-a", Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;

    let (second, _) = db.try_acquire_lock("k", "worker-b", TTL).await.unwrap().unwrap();
    assert!(second > first);

    // The old holder can neither renew nor release the taken-over lease
    assert!(db.renew_lock("k", first, TTL).await.unwrap().is_none());
    assert!(!db.release_lock("k", first).await.unwrap());
    let row = db.lock_row("k").await.unwrap().unwrap();
    assert_eq!(row.holder, "worker-b");

    db.close().await;
}

#[tokio::test]
async fn test_renew_extends_expiry() {
    let (db, _file) = temp_db().await;
    let (fence, expires_at) = db
        .try_acquire_lock("k", "worker-a", Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let renewed = db.renew_lock("k", fence, TTL).await.unwrap().unwrap();
    assert!(renewed > expires_at);

    db.close().await;
}

#[tokio::test]
async fn test_concurrent_acquire_single_winner() {
    let (db, _file) = temp_db().await;
    let db = std::sync::Arc::new(db);

    let mut handles = Vec::new();
    for n in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.try_acquire_lock("k", &format!("worker-{n}"), TTL)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
