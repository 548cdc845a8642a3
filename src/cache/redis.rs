//! Cache in a shared Redis

use super::Cache;
use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use std::time::Duration;

/// Redis-backed cache; values expire via `SET .. EX`
#[derive(Clone)]
pub struct RedisCache {
    client: Client,
    ttl: Duration,
}

impl RedisCache {
    /// Cache on the Redis at `url`, entries living for `ttl`
    pub fn new(url: &str, ttl: Duration) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            Error::config("cache.redis_url", format!("invalid Redis URL: {}", e))
        })?;
        Ok(Self { client, ttl })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Other(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| Error::Other(format!("Redis GET failed: {}", e)))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let seconds = self.ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds)
            .await
            .map_err(|e| Error::Other(format!("Redis SET failed: {}", e)))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| Error::Other(format!("Redis DEL failed: {}", e)))
    }
}
