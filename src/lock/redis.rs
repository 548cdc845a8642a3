//! Lease storage in a shared Redis
//!
//! A lease is the key itself (`SET .. PX ttl`, value `{holder}|{fence}`).
//! Fences come from a separate `{key}:fence` counter that is never deleted.
//! Check-and-set steps run as Lua scripts so each is atomic on the server.

use super::{Lock, LockStore};
use crate::error::{Error, LockError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{Client, Script, aio::MultiplexedConnection};
use std::time::Duration;

const ACQUIRE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
local fence = redis.call('INCR', KEYS[2])
redis.call('SET', KEYS[1], ARGV[1] .. '|' .. fence, 'PX', ARGV[2])
return fence
"#;

const RENEW: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed [`LockStore`]
#[derive(Clone)]
pub struct RedisLockStore {
    client: Client,
}

impl RedisLockStore {
    /// Store using the Redis at `url` (e.g. `redis://localhost:6379`)
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            Error::config("cache.redis_url", format!("invalid Redis URL: {}", e))
        })?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| redis_error("connect", e))
    }
}

fn redis_error(op: &str, err: redis::RedisError) -> Error {
    Error::Lock(LockError::Store(format!("Redis {} failed: {}", op, err)))
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(now)
}

fn lease_value(holder_id: &str, fence: u64) -> String {
    format!("{}|{}", holder_id, fence)
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lock>> {
        let mut conn = self.connection().await?;
        let fence: u64 = Script::new(ACQUIRE)
            .key(key)
            .key(format!("{}:fence", key))
            .arg(holder_id)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("acquire", e))?;

        if fence == 0 {
            return Ok(None);
        }
        Ok(Some(Lock {
            key: key.to_string(),
            holder_id: holder_id.to_string(),
            fence,
            expires_at: expiry(ttl),
        }))
    }

    async fn renew(&self, lock: &Lock, ttl: Duration) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.connection().await?;
        let renewed: i64 = Script::new(RENEW)
            .key(&lock.key)
            .arg(lease_value(&lock.holder_id, lock.fence))
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("renew", e))?;

        Ok((renewed == 1).then(|| expiry(ttl)))
    }

    async fn release(&self, lock: &Lock) -> Result<bool> {
        let mut conn = self.connection().await?;
        let released: i64 = Script::new(RELEASE)
            .key(&lock.key)
            .arg(lease_value(&lock.holder_id, lock.fence))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("release", e))?;

        Ok(released == 1)
    }
}
