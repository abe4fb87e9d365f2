//! Best-effort distributed locks over the key/value store.
//!
//! Guards against duplicate concurrent work (cache stampede). The hold
//! time bounds a crashed holder, so the system always makes forward
//! progress; failure to acquire never blocks the caller from proceeding.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::store::KeyValueStore;

/// Default lock hold time.
pub const DEFAULT_HOLD: Duration = Duration::from_secs(3);

/// Interval between acquisition attempts while waiting.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Proof of lock ownership; pass back to `release`.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    owner: String,
}

/// Mutual-exclusion lock manager keyed by `lock:<name>`.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    hold: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_hold(store, DEFAULT_HOLD)
    }

    pub fn with_hold(store: Arc<dyn KeyValueStore>, hold: Duration) -> Self {
        Self { store, hold }
    }

    /// One-shot acquisition attempt.
    ///
    /// `None` means the lock is held elsewhere, or the store is degraded;
    /// callers branch on the option and proceed without exclusion either
    /// way.
    pub async fn try_acquire(&self, name: &str) -> Option<LockGuard> {
        let key = format!("lock:{name}");
        let owner = Uuid::new_v4().to_string();
        self.attempt(&key, &owner).await
    }

    /// Acquire with a bounded wait (the hold time).
    ///
    /// While a live holder exists, this polls until the holder releases or
    /// crashes past its expiry, which is what makes concurrent callers of
    /// the same key converge on a single recomputation.
    pub async fn acquire(&self, name: &str) -> Option<LockGuard> {
        let key = format!("lock:{name}");
        let owner = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.hold;

        loop {
            match self.store.set_nx_ex(&key, &owner, self.hold).await {
                Ok(true) => {
                    debug!(key = %key, "lock acquired");
                    return Some(LockGuard { key, owner });
                }
                Ok(false) => {
                    if Instant::now() + RETRY_INTERVAL > deadline {
                        debug!(key = %key, "lock wait exhausted");
                        return None;
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "lock store degraded, skipping lock");
                    return None;
                }
            }
        }
    }

    async fn attempt(&self, key: &str, owner: &str) -> Option<LockGuard> {
        match self.store.set_nx_ex(key, owner, self.hold).await {
            Ok(true) => {
                debug!(key = %key, "lock acquired");
                Some(LockGuard {
                    key: key.to_string(),
                    owner: owner.to_string(),
                })
            }
            Ok(false) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "lock store degraded, skipping lock");
                None
            }
        }
    }

    /// Release a held lock.
    ///
    /// Deletes only while we still own it; an expired lock may already
    /// belong to another process.
    pub async fn release(&self, guard: LockGuard) {
        match self.store.get(&guard.key).await {
            Ok(Some(owner)) if owner == guard.owner => {
                if let Err(e) = self.store.del(&guard.key).await {
                    warn!(key = %guard.key, error = %e, "lock release failed");
                }
            }
            Ok(_) => debug!(key = %guard.key, "lock expired before release"),
            Err(e) => warn!(key = %guard.key, error = %e, "lock release read failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn manager(hold: Duration) -> LockManager {
        LockManager::with_hold(Arc::new(MemoryStore::new()), hold)
    }

    #[tokio::test]
    async fn test_try_acquire_conflicts() {
        let locks = manager(Duration::from_secs(3));

        let guard = locks.try_acquire("chat:c1").await;
        assert!(guard.is_some());
        assert!(locks.try_acquire("chat:c1").await.is_none());

        // A different name is a different lock.
        assert!(locks.try_acquire("chat:c2").await.is_some());
    }

    #[tokio::test]
    async fn test_release_allows_reacquire() {
        let locks = manager(Duration::from_secs(3));

        let guard = locks.try_acquire("chat:c1").await.unwrap();
        locks.release(guard).await;
        assert!(locks.try_acquire("chat:c1").await.is_some());
    }

    #[tokio::test]
    async fn test_expired_hold_is_reacquirable() {
        let locks = manager(Duration::from_millis(20));

        let _guard = locks.try_acquire("chat:c1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(locks.try_acquire("chat:c1").await.is_some());
    }

    #[tokio::test]
    async fn test_stale_release_keeps_new_owner() {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::with_hold(store.clone(), Duration::from_millis(20));

        let stale = locks.try_acquire("chat:c1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fresh = locks.try_acquire("chat:c1").await.unwrap();
        locks.release(stale).await;

        // The stale guard must not have deleted the new holder's lock.
        assert!(locks.try_acquire("chat:c1").await.is_none());
        locks.release(fresh).await;
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::with_hold(store, Duration::from_secs(2));

        let guard = locks.try_acquire("chat:c1").await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("chat:c1").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        locks.release(guard).await;

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_some());
    }
}
