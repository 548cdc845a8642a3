//! Leased article locks with fencing tokens
//!
//! [`DistributedLock`] serializes processing of one article across every
//! worker sharing a [`LockStore`]. A lease self-expires after its TTL, so a
//! crashed holder never blocks an article forever; no reaper is needed.
//!
//! Every successful acquisition returns a fencing token strictly greater than
//! any previously issued for the same key. Writers present the token to the
//! primary store and search index, which reject writes from an older lease.
//!
//! ## Implementations
//!
//! - [`Database`](crate::db::Database): shared SQLite lock table
//! - [`MemoryLockStore`]: in-process, for tests and single-worker runs
//! - `RedisLockStore` (feature `redis`): shared Redis keys

use crate::error::{Error, LockError, Result};
use crate::types::ArticleId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod sqlite;

pub use memory::MemoryLockStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;

/// A held lease
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lock {
    /// Namespaced key (`{prefix}:lock:{articleId}`)
    pub key: String,
    /// Holder that owns the lease
    pub holder_id: String,
    /// Fencing token; strictly increasing per key
    pub fence: u64,
    /// When the lease lapses absent renewal
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    /// Whether the lease has lapsed by the local clock
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Result of an acquisition attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lease is ours
    Acquired(Lock),
    /// A live lease exists; someone else is doing the work
    AlreadyHeld,
}

/// Atomic check-and-set lease storage
///
/// Implementations must guarantee that at most one unexpired lease exists per
/// key at any instant, across every process sharing the store.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lease on `key` if no unexpired lease exists
    ///
    /// Returns `None` while another lease is live, whoever holds it.
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration)
    -> Result<Option<Lock>>;

    /// Extend `lock` by `ttl` from now
    ///
    /// Returns the new expiry, or `None` when the lease already expired or
    /// was taken over.
    async fn renew(&self, lock: &Lock, ttl: Duration) -> Result<Option<DateTime<Utc>>>;

    /// Expire `lock` now; `false` when it had already lapsed or been taken over
    async fn release(&self, lock: &Lock) -> Result<bool>;
}

/// Article-keyed leases for one worker identity
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    prefix: String,
    holder_id: String,
    ttl: Duration,
}

impl DistributedLock {
    /// Leases in `store` under `prefix`, held as `holder_id` for `ttl`
    pub fn new(
        store: Arc<dyn LockStore>,
        prefix: impl Into<String>,
        holder_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            holder_id: holder_id.into(),
            ttl,
        }
    }

    /// Lock key for an article
    pub fn key_for(&self, article_id: &ArticleId) -> String {
        format!("{}:lock:{}", self.prefix, article_id)
    }

    /// This worker's holder identity
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Lease duration
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the lease for `article_id`
    pub async fn acquire(&self, article_id: &ArticleId) -> Result<LockOutcome> {
        let key = self.key_for(article_id);
        let acquired = self
            .store
            .try_acquire(&key, &self.holder_id, self.ttl)
            .await
            .map_err(store_error)?;

        Ok(match acquired {
            Some(lock) => {
                tracing::debug!(key = %lock.key, fence = lock.fence, "Lease acquired");
                LockOutcome::Acquired(lock)
            }
            None => LockOutcome::AlreadyHeld,
        })
    }

    /// Extend a held lease
    ///
    /// Fails with [`LockError::Lost`] once the lease has expired or been taken
    /// over; the caller no longer owns the article.
    pub async fn renew(&self, lock: &mut Lock) -> Result<()> {
        match self
            .store
            .renew(lock, self.ttl)
            .await
            .map_err(store_error)?
        {
            Some(expires_at) => {
                lock.expires_at = expires_at;
                Ok(())
            }
            None => Err(LockError::Lost {
                key: lock.key.clone(),
                fence: lock.fence,
            }
            .into()),
        }
    }

    /// Give the lease back; a no-op when it already lapsed
    pub async fn release(&self, lock: &Lock) -> Result<()> {
        let released = self.store.release(lock).await.map_err(store_error)?;
        if !released {
            tracing::debug!(
                key = %lock.key,
                fence = lock.fence,
                "Lease already expired at release"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("prefix", &self.prefix)
            .field("holder_id", &self.holder_id)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Store failures surface as [`LockError::Store`] so they retry as transient
fn store_error(err: Error) -> Error {
    match err {
        Error::Lock(_) => err,
        other => Error::Lock(LockError::Store(other.to_string())),
    }
}

/// Holder identity for this process: `{host}-{pid}-{random}`
pub fn generate_holder_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("{}-{}-{:08x}", host, std::process::id(), suffix)
}
