//! Primary article records: fenced, content-versioned upserts.

use crate::error::{DatabaseError, PersistenceError};
use crate::persistence::ArticleRecord;
use crate::types::{ArticleId, PersistedArticle};
use crate::{Error, Result};
use chrono::{TimeZone, Utc};
use sqlx::SqliteConnection;

use super::{ArticleRow, ArticleWrite, Database, now_ms};

fn fence_to_sql(fence: u64) -> i64 {
    i64::try_from(fence).unwrap_or(i64::MAX)
}

fn decode_json<T: serde::de::DeserializeOwned>(article_id: &str, column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        Error::Database(DatabaseError::CorruptRow(format!(
            "articles.{} for {}: {}",
            column, article_id, e
        )))
    })
}

impl TryFrom<ArticleRow> for PersistedArticle {
    type Error = Error;

    fn try_from(row: ArticleRow) -> Result<Self> {
        let id = row.article_id.as_str();
        Ok(PersistedArticle {
            translated_variants: decode_json(id, "translated_variants", &row.translated_variants)?,
            images: decode_json(id, "images", &row.images)?,
            tags: decode_json(id, "tags", &row.tags)?,
            metadata: decode_json(id, "metadata", &row.metadata)?,
            degradations: decode_json(id, "degradations", &row.degradations)?,
            article_id: ArticleId::new(row.article_id),
            blob_key: row.blob_key,
            mime_type: row.mime_type,
            source_origin: row.source_origin,
            content_hash: row.content_hash,
            content: row.content,
            language: row.language,
            version: row.version,
            indexed_version: row.indexed_version,
            updated_at: Utc
                .timestamp_millis_opt(row.updated_at)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

impl Database {
    /// Insert or update an article record under lease token `fence`
    ///
    /// - a write with a fence lower than the stored one is rejected with
    ///   [`PersistenceError::Superseded`]
    /// - a write whose content hash matches the stored one keeps `version`
    ///   and `updated_at` unchanged
    /// - any other write bumps `version`
    ///
    /// Runs under `BEGIN IMMEDIATE` so the stored hash read beforehand is the
    /// one the upsert replaces.
    pub async fn upsert_article(&self, record: &ArticleRecord, fence: u64) -> Result<ArticleWrite> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert article {}: {}",
                record.article_id, e
            )))
        })?;

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to upsert article {}: {}",
                    record.article_id, e
                )))
            })?;

        match Self::write_article(&mut conn, record, fence).await {
            Ok(write) => {
                sqlx::query("COMMIT").execute(&mut *conn).await.map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to commit article {}: {}",
                        record.article_id, e
                    )))
                })?;
                Ok(write)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn write_article(
        conn: &mut SqliteConnection,
        record: &ArticleRecord,
        fence: u64,
    ) -> Result<ArticleWrite> {
        let now = now_ms();
        let content_hash = record.content_hash()?;
        let query_failed = |e: sqlx::Error| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert article {}: {}",
                record.article_id, e
            )))
        };

        let stored: Option<(String, i64)> =
            sqlx::query_as("SELECT content_hash, fence FROM articles WHERE article_id = ?")
                .bind(record.article_id.as_str())
                .fetch_optional(&mut *conn)
                .await
                .map_err(query_failed)?;

        let written: Option<(i64, i64)> = sqlx::query_as(
            r#"
            INSERT INTO articles (
                article_id, blob_key, mime_type, source_origin, content_hash, content,
                language, translated_variants, images, tags, metadata, degradations,
                fence, version, indexed_version, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, NULL, ?, ?)
            ON CONFLICT(article_id) DO UPDATE SET
                version = CASE WHEN articles.content_hash = excluded.content_hash
                          THEN articles.version ELSE articles.version + 1 END,
                updated_at = CASE WHEN articles.content_hash = excluded.content_hash
                             THEN articles.updated_at ELSE excluded.updated_at END,
                blob_key = excluded.blob_key,
                mime_type = excluded.mime_type,
                source_origin = excluded.source_origin,
                content_hash = excluded.content_hash,
                content = excluded.content,
                language = excluded.language,
                translated_variants = excluded.translated_variants,
                images = excluded.images,
                tags = excluded.tags,
                metadata = excluded.metadata,
                degradations = excluded.degradations,
                fence = excluded.fence
            WHERE articles.fence <= excluded.fence
            RETURNING version, updated_at
            "#,
        )
        .bind(record.article_id.as_str())
        .bind(&record.blob_key)
        .bind(&record.mime_type)
        .bind(&record.source_origin)
        .bind(&content_hash)
        .bind(&record.content)
        .bind(&record.language)
        .bind(serde_json::to_string(&record.translated_variants)?)
        .bind(serde_json::to_string(&record.images)?)
        .bind(serde_json::to_string(&record.tags)?)
        .bind(serde_json::to_string(&record.metadata)?)
        .bind(serde_json::to_string(&record.degradations)?)
        .bind(fence_to_sql(fence))
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_failed)?;

        match (written, stored) {
            (Some((version, updated_at)), stored) => Ok(ArticleWrite {
                version,
                changed: stored.is_none_or(|(hash, _)| hash != content_hash),
                updated_at,
            }),
            (None, stored) => Err(PersistenceError::Superseded {
                article_id: record.article_id.to_string(),
                fence,
                current: stored
                    .and_then(|(_, current)| u64::try_from(current).ok())
                    .unwrap_or(0),
            }
            .into()),
        }
    }

    /// Load one article record
    pub async fn get_article(&self, article_id: &ArticleId) -> Result<Option<PersistedArticle>> {
        let row: Option<ArticleRow> = sqlx::query_as(
            r#"
            SELECT article_id, blob_key, mime_type, source_origin, content_hash, content,
                   language, translated_variants, images, tags, metadata, degradations,
                   version, indexed_version, updated_at
            FROM articles WHERE article_id = ?
            "#,
        )
        .bind(article_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load article {}: {}",
                article_id, e
            )))
        })?;

        row.map(PersistedArticle::try_from).transpose()
    }

    /// Stored fencing token of the last writer
    pub async fn article_fence(&self, article_id: &ArticleId) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT fence FROM articles WHERE article_id = ?")
            .bind(article_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read article fence: {}",
                    e
                )))
            })
    }

    /// Mark the search index as reflecting `version`
    ///
    /// Ignored when the record has since moved past `version`.
    pub async fn mark_article_indexed(&self, article_id: &ArticleId, version: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE articles SET indexed_version = ? WHERE article_id = ? AND version = ?",
        )
        .bind(version)
        .bind(article_id.as_str())
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark article indexed: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Articles whose search document lags the primary record
    pub async fn unindexed_articles(&self) -> Result<Vec<ArticleId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT article_id FROM articles
            WHERE indexed_version IS NULL OR indexed_version <> version
            ORDER BY updated_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list unindexed articles: {}",
                e
            )))
        })?;

        Ok(ids.into_iter().map(ArticleId::new).collect())
    }
}
