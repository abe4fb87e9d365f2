//! Scope-versioned cache keys.
//!
//! A scope version is a counter embedded in every composite key built for
//! that scope. Bumping it strands all previously built keys at once: a
//! soft O(1) invalidation with no pattern scan. Stranded entries fall out
//! of the store at their own TTL.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::store::KeyValueStore;
use super::Result;

/// Scope version retention. Long enough that a live scope's version never
/// expires between reads.
pub const DEFAULT_VERSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Scope version registry over the key/value store.
pub struct ScopeVersions {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl ScopeVersions {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_ttl(store, DEFAULT_VERSION_TTL)
    }

    pub fn with_ttl(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Retention from configuration.
    pub fn from_config(store: Arc<dyn KeyValueStore>, config: &crate::config::CacheConfig) -> Self {
        Self::with_ttl(store, Duration::from_secs(config.scope_version_ttl_secs))
    }

    fn scope_key(scope: &str) -> String {
        format!("v:{scope}")
    }

    fn namespaced_key(namespace: &str, scope: &str) -> String {
        format!("v:{namespace}:{scope}")
    }

    /// Current version for a scope, initializing at "1" on first read.
    ///
    /// A degraded store reads as "1"; the same store also misses every data
    /// key, so a stale version cannot serve stale data.
    pub async fn current(&self, scope: &str) -> String {
        self.current_by_key(&Self::scope_key(scope)).await
    }

    async fn current_by_key(&self, key: &str) -> String {
        match self.store.get(key).await {
            Ok(Some(version)) => version,
            Ok(None) => {
                if let Err(e) = self.store.set_nx_ex(key, "1", self.ttl).await {
                    warn!(key = %key, error = %e, "scope version init failed");
                }
                "1".to_string()
            }
            Err(e) => {
                warn!(key = %key, error = %e, "scope version read failed");
                "1".to_string()
            }
        }
    }

    /// Invalidate every cached key built for this scope.
    pub async fn bump_scope(&self, scope: &str) -> Result<()> {
        self.bump_by_key(&Self::scope_key(scope)).await
    }

    /// Invalidate a namespaced scope (`v:<namespace>:<scope>` keys).
    pub async fn bump_namespaced_scope(&self, namespace: &str, scope: &str) -> Result<()> {
        self.bump_by_key(&Self::namespaced_key(namespace, scope)).await
    }

    async fn bump_by_key(&self, key: &str) -> Result<()> {
        match self.store.incr(key).await {
            Ok(version) => {
                // A bump must always move past the lazily-initialized
                // version, even when the version key itself had expired.
                if version == 1 {
                    self.store.set_ex(key, "2", self.ttl).await?;
                    return Ok(());
                }
            }
            Err(e) => {
                // Stores without a usable INCR for this key fall back to an
                // explicit write past the initial version.
                warn!(key = %key, error = %e, "scope bump increment failed, setting explicitly");
                self.store.set_ex(key, "2", self.ttl).await?;
                return Ok(());
            }
        }
        self.store.expire(key, self.ttl).await
    }

    /// Composite key for a cached read: `v<version>:<topic>:<paramsJSON>`.
    pub async fn versioned_key(&self, scope: &str, topic: &str, params: &Value) -> String {
        let version = self.current(scope).await;
        format_versioned_key(&version, topic, params)
    }
}

/// Build a versioned composite key.
///
/// serde_json maps iterate in sorted key order, so equal parameter sets
/// always encode to the same key.
pub fn format_versioned_key(version: &str, topic: &str, params: &Value) -> String {
    format!("v{version}:{topic}:{params}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::MemoryStore;

    fn versions() -> ScopeVersions {
        ScopeVersions::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_version_initializes_at_one() {
        let versions = versions();
        assert_eq!(versions.current("livechat:campaigns").await, "1");
        // Stable across reads.
        assert_eq!(versions.current("livechat:campaigns").await, "1");
    }

    #[tokio::test]
    async fn test_bump_changes_versioned_key() {
        let versions = versions();
        let params = json!({"companyId": "acme", "page": 1});

        let before = versions
            .versioned_key("livechat:campaigns", "campaigns", &params)
            .await;
        versions.bump_scope("livechat:campaigns").await.unwrap();
        let after = versions
            .versioned_key("livechat:campaigns", "campaigns", &params)
            .await;

        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_bump_on_fresh_scope_still_invalidates() {
        let versions = versions();
        let params = json!({"companyId": "acme"});

        // Keys built before the scope version ever existed use "1".
        let before = format_versioned_key("1", "campaigns", &params);
        versions.bump_scope("livechat:campaigns").await.unwrap();
        let after = versions
            .versioned_key("livechat:campaigns", "campaigns", &params)
            .await;

        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_repeated_bumps_are_monotonic() {
        let versions = versions();
        versions.bump_scope("s").await.unwrap();
        let v2 = versions.current("s").await;
        versions.bump_scope("s").await.unwrap();
        let v3 = versions.current("s").await;

        assert_eq!(v2, "2");
        assert_eq!(v3, "3");
    }

    #[tokio::test]
    async fn test_namespaced_scope_is_independent() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let versions = ScopeVersions::new(store.clone());

        versions
            .bump_namespaced_scope("acme", "livechat:campaigns")
            .await
            .unwrap();

        assert_eq!(
            store.get("v:acme:livechat:campaigns").await.unwrap(),
            Some("2".to_string())
        );
        // The plain scope is untouched.
        assert_eq!(versions.current("livechat:campaigns").await, "1");
    }

    #[tokio::test]
    async fn test_versioned_key_is_canonical() {
        let versions = versions();
        let a = versions
            .versioned_key("s", "campaigns", &json!({"b": 1, "a": 2}))
            .await;
        let b = versions
            .versioned_key("s", "campaigns", &json!({"a": 2, "b": 1}))
            .await;
        assert_eq!(a, b);
    }

    #[test]
    fn test_format_versioned_key() {
        let key = format_versioned_key("3", "campaigns", &json!({"companyId": "acme"}));
        assert_eq!(key, r#"v3:campaigns:{"companyId":"acme"}"#);
    }
}
