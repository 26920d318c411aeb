//! Wildcard key enumeration and deletion.
//!
//! Keys are streamed from the store page by page and deleted one batch at a
//! time, so neither side ever holds the full match set. Pattern-wide
//! operations share one process-wide mutex.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use metrics::histogram;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::StoreError;
use super::store::{CacheStore, bounded, delete_with_fallback};

const METRIC_PATTERN_DELETE_MS: &str = "cascade_cache_pattern_delete_ms";

/// Pattern that matches every key in the store.
pub const MATCH_ALL: &str = "*";

pub struct PatternScanner {
    store: Arc<dyn CacheStore>,
    batch_size: usize,
    deadline: Duration,
    invalidation: Mutex<()>,
}

impl PatternScanner {
    pub fn new(store: Arc<dyn CacheStore>, batch_size: usize, deadline: Duration) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            deadline,
            invalidation: Mutex::new(()),
        }
    }

    /// Delete every key matching `pattern`, absorbing failures.
    ///
    /// Returns the number of keys removed before any failure.
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        match self.try_delete_by_pattern(pattern).await {
            Ok(removed) => removed,
            Err(PatternDeleteError { removed, source }) => {
                warn!(
                    pattern,
                    removed,
                    error = %source,
                    "Pattern delete failed; cache entries may linger until expiry"
                );
                removed
            }
        }
    }

    /// Delete every key matching `pattern`, reporting the first store failure
    /// along with how much was removed before it.
    pub async fn try_delete_by_pattern(&self, pattern: &str) -> Result<u64, PatternDeleteError> {
        if self.store.endpoint_count() == 0 {
            warn!(pattern, "Store reports no endpoints; skipping pattern delete");
            return Ok(0);
        }

        let _exclusive = self.invalidation.lock().await;
        let started_at = Instant::now();

        let mut removed = 0_u64;
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut keys = self.store.scan_keys(pattern, self.batch_size);

        let outcome: Result<(), StoreError> = async {
            while let Some(key) = bounded(self.deadline, keys.try_next()).await? {
                batch.push(key);
                if batch.len() >= self.batch_size {
                    removed +=
                        delete_with_fallback(self.store.as_ref(), &batch, self.deadline).await?;
                    batch.clear();
                }
            }
            removed += delete_with_fallback(self.store.as_ref(), &batch, self.deadline).await?;
            Ok(())
        }
        .await;

        histogram!(METRIC_PATTERN_DELETE_MS)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(()) => {
                if removed > 0 {
                    info!(pattern, removed, "Deleted keys by pattern");
                } else {
                    debug!(pattern, "Pattern matched no keys");
                }
                Ok(removed)
            }
            Err(source) => Err(PatternDeleteError { removed, source }),
        }
    }

    /// Flush every key in the store.
    pub async fn clear_all(&self) -> u64 {
        self.delete_by_pattern(MATCH_ALL).await
    }

    /// Collect the keys matching `pattern`, absorbing failures into an empty
    /// or partial list.
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        self.try_keys(pattern, None).await.unwrap_or_else(|(partial, error)| {
            warn!(pattern, error = %error, "Key listing failed");
            partial
        })
    }

    /// Collect up to `limit` keys matching `pattern`. On failure the keys
    /// gathered so far come back with the error.
    pub async fn try_keys(
        &self,
        pattern: &str,
        limit: Option<usize>,
    ) -> Result<Vec<String>, (Vec<String>, StoreError)> {
        if self.store.endpoint_count() == 0 {
            warn!(pattern, "Store reports no endpoints; skipping key listing");
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let mut keys = self.store.scan_keys(pattern, self.batch_size);
        loop {
            if limit.is_some_and(|limit| found.len() >= limit) {
                return Ok(found);
            }
            match bounded(self.deadline, keys.try_next()).await {
                Ok(Some(key)) => found.push(key),
                Ok(None) => return Ok(found),
                Err(error) => return Err((found, error)),
            }
        }
    }
}

/// A pattern delete that stopped early.
#[derive(Debug, thiserror::Error)]
#[error("pattern delete stopped after removing {removed} keys: {source}")]
pub struct PatternDeleteError {
    pub removed: u64,
    #[source]
    pub source: StoreError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    async fn seeded(keys: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for key in keys {
            store
                .set_string(key, "v", Duration::from_secs(60))
                .await
                .expect("seed");
        }
        store
    }

    #[tokio::test]
    async fn deletes_in_batches() {
        let keys: Vec<String> = (0..25).map(|i| format!("page:{i}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let store = seeded(&refs).await;
        store
            .set_string("product:1", "v", Duration::from_secs(60))
            .await
            .expect("seed");
        let scanner = PatternScanner::new(store.clone(), 10, Duration::from_secs(1));

        assert_eq!(scanner.delete_by_pattern("page:*").await, 25);
        assert_eq!(store.bulk_delete_calls(), 3);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn pattern_deletes_wait_for_the_invalidation_mutex() {
        let store = seeded(&["page:1", "page:2", "page:3"]).await;
        let scanner = PatternScanner::new(store.clone(), 1000, Duration::from_secs(1));

        let held = scanner.invalidation.lock().await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), scanner.delete_by_pattern("page:*"))
                .await;
        assert!(blocked.is_err());
        assert_eq!(store.len(), 3);

        drop(held);
        assert_eq!(scanner.delete_by_pattern("page:*").await, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_concurrent_deletes_count_each_key_once() {
        let keys: Vec<String> = (0..200).map(|i| format!("page:{i}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let store = seeded(&refs).await;
        let scanner = Arc::new(PatternScanner::new(store.clone(), 16, Duration::from_secs(1)));

        let tasks: Vec<_> = ["page:*", "page:1*", "page:*", "page:?"]
            .into_iter()
            .map(|pattern| {
                let scanner = Arc::clone(&scanner);
                tokio::spawn(async move { scanner.delete_by_pattern(pattern).await })
            })
            .collect();

        let mut total = 0;
        for task in tasks {
            total += task.await.expect("join");
        }
        assert_eq!(total, 200);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn second_delete_is_a_no_op() {
        let store = seeded(&["page:1", "page:2"]).await;
        let scanner = PatternScanner::new(store, 1000, Duration::from_secs(1));

        assert_eq!(scanner.delete_by_pattern("page:*").await, 2);
        assert_eq!(scanner.delete_by_pattern("page:*").await, 0);
    }

    #[tokio::test]
    async fn no_endpoints_degrades_to_no_op() {
        let store = seeded(&["page:1"]).await;
        store.set_endpoint_count(0);
        let scanner = PatternScanner::new(store.clone(), 1000, Duration::from_secs(1));

        assert_eq!(scanner.delete_by_pattern("page:*").await, 0);
        assert_eq!(store.len(), 1);
        assert!(scanner.keys("*").await.is_empty());
    }

    #[tokio::test]
    async fn offline_store_is_absorbed() {
        let store = seeded(&["page:1"]).await;
        store.set_offline(true);
        let scanner = PatternScanner::new(store, 1000, Duration::from_secs(1));

        assert_eq!(scanner.delete_by_pattern("page:*").await, 0);
        assert!(scanner.try_delete_by_pattern("page:*").await.is_err());
        assert!(scanner.keys("page:*").await.is_empty());
    }

    #[tokio::test]
    async fn clear_all_flushes_everything() {
        let store = seeded(&["a", "b:1", "c:2:3"]).await;
        let scanner = PatternScanner::new(store.clone(), 2, Duration::from_secs(1));

        assert_eq!(scanner.clear_all().await, 3);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn key_listing_honours_limit() {
        let store = seeded(&["user:1", "user:2", "user:3"]).await;
        let scanner = PatternScanner::new(store, 1000, Duration::from_secs(1));

        assert_eq!(scanner.keys("user:*").await.len(), 3);
        let limited = scanner.try_keys("user:*", Some(2)).await.expect("keys");
        assert_eq!(limited.len(), 2);
    }
}
