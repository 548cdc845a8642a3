//! In-process cache backed by moka

use super::Cache;
use crate::error::Result;
use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use std::time::Duration;

/// Bounded in-memory cache; entries expire `ttl` after insertion
///
/// Not shared across worker processes, which is fine for an advisory cache.
#[derive(Clone)]
pub struct MemoryCache {
    entries: MokaCache<String, String>,
}

impl MemoryCache {
    /// Cache holding at most `max_entries` values for `ttl` each
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let entries = MokaCache::builder()
            .max_capacity(max_entries as u64)
            .time_to_live(ttl)
            .build();
        Self { entries }
    }

    /// Approximate number of live entries
    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).await)
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string()).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.invalidate(key).await;
        Ok(())
    }
}
