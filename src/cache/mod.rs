//! Single-flight caching over a pluggable key/value store.
//!
//! This module contains:
//! - `KeyValueStore` trait with Redis and in-memory implementations
//! - `LockManager`: best-effort distributed locks against cache stampede
//! - `SingleFlightCache`: read-through caching with lock-guarded
//!   recomputation and jittered TTLs
//! - `ScopeVersions`: O(1) bulk invalidation through versioned keys

mod lock;
mod scope;
mod single_flight;
mod store;

pub use lock::{LockGuard, LockManager};
pub use scope::{format_versioned_key, ScopeVersions};
pub use single_flight::SingleFlightCache;
pub use store::{KeyValueStore, MemoryStore, RedisStore};

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur against the cache store.
///
/// Callers of the single-flight layer never see these for reads: store
/// failures degrade to cache misses.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Store(e.to_string())
    }
}
