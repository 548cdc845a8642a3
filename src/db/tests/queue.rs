use super::temp_db;
use std::time::Duration;

const VISIBILITY: Duration = Duration::from_secs(30);

#[tokio::test]
async fn test_receive_claims_and_hides_message() {
    let (db, _file) = temp_db().await;
    let id = db.enqueue_message("a-1", r#"{"articleId":"a-1"}"#, Duration::ZERO)
        .await
        .unwrap();

    let rows = db.receive_messages(10, VISIBILITY).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].attempt, 1);
    assert_eq!(rows[0].receive_count, 1);
    assert_eq!(rows[0].receipt.len(), 32);

    // Hidden until the visibility timeout lapses
    assert!(db.receive_messages(10, VISIBILITY).await.unwrap().is_empty());
    assert_eq!(db.queue_depth().await.unwrap(), 1);

    db.close().await;
}

#[tokio::test]
async fn test_delayed_message_is_not_visible() {
    let (db, _file) = temp_db().await;
    db.enqueue_message("a-1", "{}", Duration::from_secs(60))
        .await
        .unwrap();

    assert!(db.receive_messages(10, VISIBILITY).await.unwrap().is_empty());

    db.close().await;
}

#[tokio::test]
async fn test_receive_respects_limit_and_order() {
    let (db, _file) = temp_db().await;
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(
            db.enqueue_message(&format!("a-{n}"), "{}", Duration::ZERO)
                .await
                .unwrap(),
        );
    }

    let first = db.receive_messages(3, VISIBILITY).await.unwrap();
    let second = db.receive_messages(3, VISIBILITY).await.unwrap();

    let first_ids: Vec<i64> = first.iter().map(|r| r.id).collect();
    let second_ids: Vec<i64> = second.iter().map(|r| r.id).collect();
    assert_eq!(first_ids, ids[..3]);
    assert_eq!(second_ids, ids[3..]);

    db.close().await;
}

#[tokio::test]
async fn test_delete_requires_current_receipt() {
    let (db, _file) = temp_db().await;
    let id = db.enqueue_message("a-1", "{}", Duration::ZERO).await.unwrap();

    let first = db.receive_messages(1, Duration::ZERO).await.unwrap().remove(0);
    // Zero visibility: immediately redelivered with a new receipt
    let second = db.receive_messages(1, VISIBILITY).await.unwrap().remove(0);
    assert_ne!(first.receipt, second.receipt);
    assert_eq!(second.receive_count, 2);

    assert!(!db.delete_message(id, &first.receipt).await.unwrap());
    assert_eq!(db.queue_depth().await.unwrap(), 1);

    assert!(db.delete_message(id, &second.receipt).await.unwrap());
    assert_eq!(db.queue_depth().await.unwrap(), 0);

    db.close().await;
}

#[tokio::test]
async fn test_visibility_change_counted_and_uncounted() {
    let (db, _file) = temp_db().await;
    let id = db.enqueue_message("a-1", "{}", Duration::ZERO).await.unwrap();

    let row = db.receive_messages(1, VISIBILITY).await.unwrap().remove(0);
    assert!(
        db.change_message_visibility(id, &row.receipt, Duration::ZERO, false)
            .await
            .unwrap()
    );
    let (attempt, receive_count, _) = db.message_state(id).await.unwrap().unwrap();
    assert_eq!((attempt, receive_count), (1, 1));

    let row = db.receive_messages(1, VISIBILITY).await.unwrap().remove(0);
    assert!(
        db.change_message_visibility(id, &row.receipt, Duration::ZERO, true)
            .await
            .unwrap()
    );
    let (attempt, receive_count, _) = db.message_state(id).await.unwrap().unwrap();
    assert_eq!((attempt, receive_count), (2, 2));

    // The receipt was consumed by the visibility change
    assert!(
        !db.change_message_visibility(id, &row.receipt, Duration::ZERO, true)
            .await
            .unwrap()
    );

    db.close().await;
}

#[tokio::test]
async fn test_visibility_change_delays_redelivery() {
    let (db, _file) = temp_db().await;
    let id = db.enqueue_message("a-1", "{}", Duration::ZERO).await.unwrap();

    let row = db.receive_messages(1, Duration::ZERO).await.unwrap().remove(0);
    db.change_message_visibility(id, &row.receipt, Duration::from_secs(60), true)
        .await
        .unwrap();

    assert!(db.receive_messages(1, VISIBILITY).await.unwrap().is_empty());

    db.close().await;
}
