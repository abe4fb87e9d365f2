//! Read-through cache with single-flight recomputation.
//!
//! Wraps a slow loader: a cache hit returns immediately; on a miss, the
//! recompute runs under a best-effort distributed lock so concurrent
//! callers across processes converge on one loader execution per key.
//! When the lock service is degraded, the system degrades to at-least-once
//! loader execution instead of failing the request.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::lock::LockManager;
use super::store::{KeyValueStore, RedisStore};
use super::Result;
use crate::config::CacheConfig;

/// Maximum fraction shaved off a TTL so entries written together do not
/// expire together.
const TTL_JITTER: f64 = 0.10;

/// Single-flight read-through cache.
pub struct SingleFlightCache {
    store: Arc<dyn KeyValueStore>,
    locks: LockManager,
}

impl SingleFlightCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let locks = LockManager::new(Arc::clone(&store));
        Self { store, locks }
    }

    /// Use a lock manager with non-default hold time.
    pub fn with_locks(store: Arc<dyn KeyValueStore>, locks: LockManager) -> Self {
        Self { store, locks }
    }

    /// Production wiring: Redis store with the configured lock hold.
    pub async fn connect(config: &CacheConfig) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(RedisStore::connect(&config.url).await?);
        let locks = LockManager::with_hold(
            Arc::clone(&store),
            Duration::from_millis(config.lock_ttl_ms),
        );
        Ok(Self::with_locks(store, locks))
    }

    /// Serve `key` from cache, or run `loader` under the recompute lock
    /// and cache its result with a jittered TTL.
    ///
    /// Loader errors are the caller's. Cache and lock failures never are:
    /// they degrade to recomputation.
    pub async fn wrap<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }

        let guard = self.locks.acquire(key).await;

        // A concurrent holder may have filled the key while we waited.
        if let Some(hit) = self.get(key).await {
            if let Some(guard) = guard {
                self.locks.release(guard).await;
            }
            return Ok(hit);
        }

        let value = match loader().await {
            Ok(value) => value,
            Err(e) => {
                if let Some(guard) = guard {
                    self.locks.release(guard).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = self.set(key, &value, ttl).await {
            warn!(key = %key, error = %e, "cache write failed");
        }
        if let Some(guard) = guard {
            self.locks.release(guard).await;
        }
        Ok(value)
    }

    /// Plain cache read. Store failures and unparseable entries read as a
    /// miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(key = %key, error = %e, "cache entry unparseable, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Plain cache write with a jittered TTL.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set_ex(key, &raw, jittered(ttl)).await
    }

    /// Explicit invalidation.
    pub async fn del(&self, key: &str) -> Result<()> {
        self.store.del(key).await
    }

    /// Pattern invalidation; returns the count removed.
    pub async fn del_match(&self, pattern: &str) -> Result<u64> {
        self.store.del_match(pattern).await
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }
}

/// TTL minus up to 10%, never below one second.
fn jittered(ttl: Duration) -> Duration {
    let shave = rand::rng().random_range(0.0..TTL_JITTER);
    let secs = ttl.as_secs_f64() * (1.0 - shave);
    Duration::from_secs_f64(secs.max(1.0))
}
