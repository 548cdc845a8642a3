//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::Database;

/// How long a writer waits on another process's write lock before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_CONNECTIONS: u32 = 8;

/// Schema v1, as `(object, statement)` pairs applied in order
const SCHEMA_V1: &[(&str, &str)] = &[
    (
        "queue_messages table",
        r#"
        CREATE TABLE queue_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            article_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 1,
            receive_count INTEGER NOT NULL DEFAULT 0,
            visible_at INTEGER NOT NULL,
            receipt TEXT,
            enqueued_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "queue visibility index",
        "CREATE INDEX idx_queue_messages_visible ON queue_messages(visible_at, id)",
    ),
    (
        "dead_letters table",
        r#"
        CREATE TABLE dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL,
            article_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            last_state TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "dead letter article index",
        "CREATE INDEX idx_dead_letters_article ON dead_letters(article_id)",
    ),
    (
        "locks table",
        r#"
        CREATE TABLE locks (
            key TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            fence INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "cache_entries table",
        r#"
        CREATE TABLE cache_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "cache expiry index",
        "CREATE INDEX idx_cache_entries_expires ON cache_entries(expires_at)",
    ),
    (
        "articles table",
        r#"
        CREATE TABLE articles (
            article_id TEXT PRIMARY KEY,
            blob_key TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            source_origin TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            content TEXT NOT NULL,
            language TEXT,
            translated_variants TEXT NOT NULL DEFAULT '{}',
            images TEXT NOT NULL DEFAULT '[]',
            tags TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            degradations TEXT NOT NULL DEFAULT '[]',
            fence INTEGER NOT NULL,
            version INTEGER NOT NULL,
            indexed_version INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "search_documents table",
        r#"
        CREATE TABLE search_documents (
            article_id TEXT PRIMARY KEY,
            fence INTEGER NOT NULL,
            version INTEGER NOT NULL,
            title TEXT,
            content TEXT NOT NULL,
            language TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "runtime_state table",
        r#"
        CREATE TABLE runtime_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
];

fn connection_failed(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::ConnectionFailed(format!("{context}: {e}")))
}

fn migration_failed(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::MigrationFailed(format!("{context}: {e}")))
}

impl Database {
    /// Open (or create) the database at `path` and bring its schema up to date
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "cannot create {}: {e}",
                    parent.display()
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(connection_failed("invalid database path"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(connection_failed("cannot open database"))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(connection_failed("cannot acquire connection"))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version \
             (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)",
        )
        .execute(&mut *conn)
        .await
        .map_err(migration_failed("schema_version table"))?;

        if Self::schema_version(&mut conn).await? < 1 {
            Self::apply_v1(&mut conn).await?;
        }
        Ok(())
    }

    async fn schema_version(conn: &mut SqliteConnection) -> Result<i64> {
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Error::Database(DatabaseError::QueryFailed(e.to_string())))?;
        Ok(version.unwrap_or(0))
    }

    async fn apply_v1(conn: &mut SqliteConnection) -> Result<()> {
        // IMMEDIATE takes the write lock up front so two workers starting
        // against a fresh file cannot both apply v1
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(migration_failed("begin v1"))?;

        match Self::create_v1(conn).await {
            Ok(applied) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(migration_failed("commit v1"))?;
                if applied {
                    tracing::info!(version = 1, "Applied database schema");
                }
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    /// Returns false when another process applied v1 first
    async fn create_v1(conn: &mut SqliteConnection) -> Result<bool> {
        if Self::schema_version(conn).await? >= 1 {
            return Ok(false);
        }

        for (object, statement) in SCHEMA_V1 {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::MigrationFailed(format!("{object}: {e}")))
                })?;
        }

        let now = chrono::Utc::now().timestamp();

        // Unclean until the first set_clean_shutdown()
        sqlx::query(
            "INSERT INTO runtime_state (key, value, updated_at) VALUES ('clean_shutdown', 'false', ?)",
        )
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(migration_failed("seed runtime state"))?;

        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (1, ?)")
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(migration_failed("record v1"))?;

        Ok(true)
    }

    /// Close the connection pool
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
