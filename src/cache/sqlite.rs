//! Cache rows in the shared SQLite database

use super::Cache;
use crate::db::Database;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Cache shared by every worker on the same database file
#[derive(Clone)]
pub struct SqliteCache {
    db: Arc<Database>,
    ttl: Duration,
}

impl SqliteCache {
    /// Entries written through this cache live for `ttl`
    pub fn new(db: Arc<Database>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Delete expired rows; returns how many were removed
    pub async fn purge_expired(&self) -> Result<u64> {
        self.db.cache_purge_expired().await
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.db.cache_get(key).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.db.cache_put(key, value, self.ttl).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.db.cache_delete(key).await
    }
}
