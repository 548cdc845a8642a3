//! SQLite-backed primary store and local search index

use super::{ArticleRecord, ArticleStore, SearchDocument, SearchIndex};
use crate::db::Database;
use crate::error::{Error, PersistenceError, Result};
use crate::types::{ArticleId, PersistedArticle};
use async_trait::async_trait;

#[async_trait]
impl ArticleStore for Database {
    async fn upsert_article(&self, record: &ArticleRecord, fence: u64) -> Result<PersistedArticle> {
        let write = Database::upsert_article(self, record, fence).await?;
        if !write.changed {
            tracing::debug!(
                article_id = %record.article_id,
                version = write.version,
                "Article content unchanged, version kept"
            );
        }

        self.get_article(&record.article_id).await?.ok_or_else(|| {
            Error::Persistence(PersistenceError::Record {
                article_id: record.article_id.to_string(),
                reason: "record vanished after upsert".to_string(),
            })
        })
    }

    async fn mark_indexed(&self, article_id: &ArticleId, version: i64) -> Result<()> {
        if !self.mark_article_indexed(article_id, version).await? {
            tracing::debug!(
                article_id = %article_id,
                version,
                "Article moved past indexed version"
            );
        }
        Ok(())
    }

    async fn load_article(&self, article_id: &ArticleId) -> Result<Option<PersistedArticle>> {
        self.get_article(article_id).await
    }
}

#[async_trait]
impl SearchIndex for Database {
    async fn upsert(&self, document: &SearchDocument) -> Result<()> {
        if self.upsert_search_document(document).await? {
            return Ok(());
        }

        let current = self
            .get_search_document(&document.article_id)
            .await?
            .map(|d| d.fence)
            .unwrap_or(0);
        Err(PersistenceError::Superseded {
            article_id: document.article_id.to_string(),
            fence: document.fence,
            current,
        }
        .into())
    }
}
