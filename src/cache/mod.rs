//! Advisory cache for expensive deterministic lookups
//!
//! Entries are keyed `{prefix}:cache:{fingerprint}` where the fingerprint is a
//! SHA-256 over the lookup's stable inputs. The cache is never authoritative:
//! [`ReadThroughCache`] treats every backend failure as a miss, so a flush or
//! an unreachable backend only costs a repeated upstream call.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod sqlite;

pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;
pub use sqlite::SqliteCache;

/// String key/value store with backend-defined expiry
#[async_trait]
pub trait Cache: Send + Sync {
    /// Unexpired value under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Drop `key`
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Stable fingerprint of a lookup's inputs
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Namespaced read-through access to a [`Cache`]
#[derive(Clone)]
pub struct ReadThroughCache {
    backend: Arc<dyn Cache>,
    prefix: String,
}

impl ReadThroughCache {
    /// Cache over `backend` with keys under `prefix`
    pub fn new(backend: Arc<dyn Cache>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    /// Full key for a fingerprint
    pub fn key(&self, fingerprint: &str) -> String {
        format!("{}:cache:{}", self.prefix, fingerprint)
    }

    /// Return the cached value for `inputs`, or compute and store it
    ///
    /// Backend errors and undecodable entries are logged and treated as a
    /// miss; only `compute`'s own error is returned.
    pub async fn get_or_compute<T, F, Fut>(&self, inputs: &[&str], compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = self.key(&fingerprint(inputs));

        match self.backend.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    tracing::trace!(key = %key, "Cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed, computing");
            }
        }

        let value = compute().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = self.backend.put(&key, &raw).await {
                    tracing::warn!(key = %key, error = %e, "Cache write failed");
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Value not cacheable");
            }
        }

        Ok(value)
    }

    /// Drop the entry for `inputs`
    pub async fn invalidate(&self, inputs: &[&str]) -> Result<()> {
        self.backend.remove(&self.key(&fingerprint(inputs))).await
    }
}

impl std::fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
