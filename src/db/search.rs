//! Local search documents.

use crate::error::DatabaseError;
use crate::persistence::SearchDocument;
use crate::types::ArticleId;
use crate::{Error, Result};
use sqlx::FromRow;

use super::{Database, now_ms};

#[derive(FromRow)]
struct SearchRow {
    article_id: String,
    fence: i64,
    version: i64,
    title: Option<String>,
    content: String,
    language: Option<String>,
    tags: String,
}

impl Database {
    /// Fenced upsert of a search document
    ///
    /// Returns `false` when a document with a higher fence is already stored.
    pub async fn upsert_search_document(&self, document: &SearchDocument) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO search_documents (
                article_id, fence, version, title, content, language, tags, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(article_id) DO UPDATE SET
                fence = excluded.fence,
                version = excluded.version,
                title = excluded.title,
                content = excluded.content,
                language = excluded.language,
                tags = excluded.tags,
                updated_at = excluded.updated_at
            WHERE search_documents.fence <= excluded.fence
            "#,
        )
        .bind(document.article_id.as_str())
        .bind(i64::try_from(document.fence).unwrap_or(i64::MAX))
        .bind(document.version)
        .bind(&document.title)
        .bind(&document.content)
        .bind(&document.language)
        .bind(serde_json::to_string(&document.tags)?)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert search document: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Load the search document for one article
    pub async fn get_search_document(
        &self,
        article_id: &ArticleId,
    ) -> Result<Option<SearchDocument>> {
        let row: Option<SearchRow> = sqlx::query_as(
            r#"
            SELECT article_id, fence, version, title, content, language, tags
            FROM search_documents WHERE article_id = ?
            "#,
        )
        .bind(article_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load search document: {}",
                e
            )))
        })?;

        row.map(|row| {
            let tags = serde_json::from_str(&row.tags).map_err(|e| {
                Error::Database(DatabaseError::CorruptRow(format!(
                    "search_documents.tags for {}: {}",
                    row.article_id, e
                )))
            })?;
            Ok(SearchDocument {
                article_id: ArticleId::new(row.article_id),
                fence: u64::try_from(row.fence).unwrap_or(0),
                version: row.version,
                title: row.title,
                content: row.content,
                language: row.language,
                tags,
            })
        })
        .transpose()
    }
}
