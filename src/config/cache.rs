//! Cache store (Redis) configuration.

use serde::Deserialize;

/// Cache store connection and timing knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis connection URL.
    pub url: String,
    /// Recompute-lock hold time in milliseconds.
    pub lock_ttl_ms: u64,
    /// Scope version retention in seconds.
    pub scope_version_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            lock_ttl_ms: 3_000,
            scope_version_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}
