//! In-process lease storage

use super::{Lock, LockStore};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Lease {
    holder_id: String,
    fence: u64,
    expires_at: DateTime<Utc>,
}

/// Lease table behind a mutex; same semantics as the shared stores
///
/// Entries are never removed, so fences keep increasing after release.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Holder of the unexpired lease on `key`, if any
    pub async fn holder(&self, key: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(key)
            .filter(|lease| lease.expires_at > Utc::now())
            .map(|lease| lease.holder_id.clone())
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(now)
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lock>> {
        let mut leases = self.leases.lock().await;
        let now = Utc::now();

        let fence = match leases.get(key) {
            Some(lease) if lease.expires_at > now => return Ok(None),
            Some(lease) => lease.fence + 1,
            None => 1,
        };

        let lease = Lease {
            holder_id: holder_id.to_string(),
            fence,
            expires_at: expiry(ttl),
        };
        let lock = Lock {
            key: key.to_string(),
            holder_id: lease.holder_id.clone(),
            fence,
            expires_at: lease.expires_at,
        };
        leases.insert(key.to_string(), lease);
        Ok(Some(lock))
    }

    async fn renew(&self, lock: &Lock, ttl: Duration) -> Result<Option<DateTime<Utc>>> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&lock.key) {
            Some(lease) if lease.fence == lock.fence && lease.expires_at > Utc::now() => {
                lease.expires_at = expiry(ttl);
                Ok(Some(lease.expires_at))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lock: &Lock) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Utc::now();
        match leases.get_mut(&lock.key) {
            Some(lease) if lease.fence == lock.fence && lease.expires_at > now => {
                lease.expires_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
