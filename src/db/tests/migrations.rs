use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_fresh_database_has_every_table() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let mut conn = db.pool.acquire().await.unwrap();
    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&mut *conn)
            .await
            .unwrap();

    for table in [
        "queue_messages",
        "dead_letters",
        "locks",
        "cache_entries",
        "articles",
        "search_documents",
        "runtime_state",
        "schema_version",
    ] {
        assert!(tables.contains(&table.to_string()), "missing table {table}");
    }
    drop(conn);

    db.close().await;
}

#[tokio::test]
async fn test_reopening_keeps_data_and_schema_version() {
    let temp_file = NamedTempFile::new().unwrap();

    let db = Database::new(temp_file.path()).await.unwrap();
    db.enqueue_message("a-1", "{}", std::time::Duration::ZERO)
        .await
        .unwrap();
    db.close().await;

    let db = Database::new(temp_file.path()).await.unwrap();
    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(versions, vec![1]);
    assert_eq!(db.queue_depth().await.unwrap(), 1, "data survives reopen");

    db.close().await;
}

#[tokio::test]
async fn test_two_workers_opening_a_fresh_file_apply_v1_once() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let (a, b) = tokio::join!(Database::new(&path), Database::new(&path));
    let a = a.unwrap();
    let b = b.unwrap();

    let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
        .fetch_one(a.pool())
        .await
        .unwrap();
    assert_eq!(versions, 1);

    a.close().await;
    b.close().await;
}
