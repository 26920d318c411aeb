//! Remote store boundary.
//!
//! The cache layer never talks to a network client directly; it goes through
//! [`CacheStore`], which `infra::redis::RedisStore` implements for production
//! and [`MemoryStore`](super::MemoryStore) implements for tests and local runs.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::warn;

use super::error::StoreError;

/// Stream of keys produced by a pattern scan. The stream pages through the
/// store lazily; nothing requires the whole key set in memory.
pub type KeyStream<'a> = BoxStream<'a, Result<String, StoreError>>;

/// String key-value store with per-key TTL and pattern enumeration.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` with an absolute expiration of `ttl` from now.
    async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete one key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete many keys in one round trip, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Reset the expiration of an existing key without rewriting its value.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Enumerate keys matching a glob pattern, `page_size` keys per round trip.
    fn scan_keys<'a>(&'a self, pattern: &'a str, page_size: usize) -> KeyStream<'a>;

    /// Number of servers a pattern scan has to visit. Zero means the store
    /// cannot tell, and pattern operations are skipped.
    fn endpoint_count(&self) -> usize;

    /// Run a privileged diagnostics command (`INFO`, `DBSIZE`). Stores that do
    /// not allow it return [`StoreError::Unsupported`].
    async fn execute_admin_command(&self, command: &str) -> Result<String, StoreError>;
}

/// Await a store call, turning an elapsed deadline into [`StoreError::Timeout`].
pub(crate) async fn bounded<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}

/// Bulk-delete `keys`, retrying once key by key when the bulk call fails.
///
/// Returns an error only when the fallback removed nothing and at least one
/// individual delete failed as well.
pub(crate) async fn delete_with_fallback(
    store: &dyn CacheStore,
    keys: &[String],
    deadline: Duration,
) -> Result<u64, StoreError> {
    if keys.is_empty() {
        return Ok(0);
    }

    let bulk_error = match bounded(deadline, store.delete_many(keys)).await {
        Ok(removed) => return Ok(removed),
        Err(error) => error,
    };

    warn!(
        key_count = keys.len(),
        error = %bulk_error,
        "Bulk delete failed, falling back to per-key deletes"
    );

    let mut removed = 0_u64;
    let mut last_error = None;
    for key in keys {
        match bounded(deadline, store.delete(key)).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(error) => {
                warn!(key = %key, error = %error, "Per-key delete failed");
                last_error = Some(error);
            }
        }
    }

    match last_error {
        Some(error) if removed == 0 => Err(error),
        _ => Ok(removed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let result: Result<(), StoreError> = bounded(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn fallback_deletes_individually_when_bulk_fails() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set_string("a", "1", ttl).await.expect("seed a");
        store.set_string("b", "2", ttl).await.expect("seed b");
        store.fail_bulk_deletes(true);

        let keys = vec!["a".to_string(), "b".to_string(), "missing".to_string()];
        let removed = delete_with_fallback(&store, &keys, Duration::from_secs(1))
            .await
            .expect("fallback succeeds");

        assert_eq!(removed, 2);
        assert!(!store.exists("a").await.expect("exists a"));
        assert!(!store.exists("b").await.expect("exists b"));
    }

    #[tokio::test]
    async fn fallback_surfaces_error_when_everything_fails() {
        let store = MemoryStore::new();
        store.set_offline(true);

        let keys = vec!["a".to_string()];
        let result = delete_with_fallback(&store, &keys, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
