//! Lease storage in the shared SQLite database

use super::{Lock, LockStore};
use crate::db::Database;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn fence_to_sql(fence: u64) -> i64 {
    i64::try_from(fence).unwrap_or(i64::MAX)
}

#[async_trait]
impl LockStore for Database {
    async fn try_acquire(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lock>> {
        let acquired = self.try_acquire_lock(key, holder_id, ttl).await?;
        Ok(acquired.map(|(fence, expires_at)| Lock {
            key: key.to_string(),
            holder_id: holder_id.to_string(),
            fence: u64::try_from(fence).unwrap_or(0),
            expires_at: from_ms(expires_at),
        }))
    }

    async fn renew(&self, lock: &Lock, ttl: Duration) -> Result<Option<DateTime<Utc>>> {
        let renewed = self
            .renew_lock(&lock.key, fence_to_sql(lock.fence), ttl)
            .await?;
        Ok(renewed.map(from_ms))
    }

    async fn release(&self, lock: &Lock) -> Result<bool> {
        self.release_lock(&lock.key, fence_to_sql(lock.fence)).await
    }
}
