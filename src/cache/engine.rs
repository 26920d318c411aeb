//! Cache-aside engine.
//!
//! Reads fail open (any store trouble is a miss), writes fail loudly, removals
//! are best effort. `get_or_compute` serializes recomputation per key through
//! the [`KeyLockRegistry`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::error::{CacheError, StoreError};
use super::key_locks::KeyLockRegistry;
use super::keys::validate_key;
use super::scanner::PatternScanner;
use super::store::{CacheStore, bounded, delete_with_fallback};

const METRIC_HIT: &str = "cascade_cache_hit_total";
const METRIC_MISS: &str = "cascade_cache_miss_total";
const METRIC_CORRUPT: &str = "cascade_cache_corrupt_total";
const METRIC_COMPUTE: &str = "cascade_cache_compute_total";
const METRIC_STORE_ERROR: &str = "cascade_cache_store_error_total";

/// Lifetime of a computed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ttl {
    #[default]
    Default,
    Long,
    Exactly(Duration),
}

/// Options for [`CacheEngine::get_or_compute`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputeOptions {
    pub ttl: Ttl,
    /// Do not cache values that serialize to an empty array or object.
    pub skip_empty: bool,
}

impl ComputeOptions {
    pub fn long() -> Self {
        Self {
            ttl: Ttl::Long,
            ..Self::default()
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Ttl::Exactly(ttl),
            ..Self::default()
        }
    }

    pub fn skip_empty(mut self) -> Self {
        self.skip_empty = true;
        self
    }
}

pub struct CacheEngine {
    store: Arc<dyn CacheStore>,
    locks: Arc<KeyLockRegistry>,
    scanner: Arc<PatternScanner>,
    config: CacheConfig,
}

impl CacheEngine {
    pub fn new(
        store: Arc<dyn CacheStore>,
        locks: Arc<KeyLockRegistry>,
        scanner: Arc<PatternScanner>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            locks,
            scanner,
            config,
        }
    }

    /// Read and decode `key`. Undecodable entries are deleted and reported as
    /// a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        validate_key(key)?;

        let raw = match bounded(self.deadline(), self.store.get_string(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                counter!(METRIC_MISS).increment(1);
                return Ok(None);
            }
            Err(error) => {
                counter!(METRIC_STORE_ERROR, "op" => "get").increment(1);
                counter!(METRIC_MISS).increment(1);
                warn!(key, error = %error, "Cache read failed; treating as miss");
                return Ok(None);
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                counter!(METRIC_HIT).increment(1);
                Ok(Some(value))
            }
            Err(error) => {
                counter!(METRIC_CORRUPT).increment(1);
                counter!(METRIC_MISS).increment(1);
                warn!(key, error = %error, "Dropping undecodable cache entry");
                self.delete_quietly(key).await;
                Ok(None)
            }
        }
    }

    /// Write `value` with the default TTL.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.set_with_ttl(key, value, self.config.default_ttl()).await
    }

    /// Write `value` with the long-lived TTL tier.
    pub async fn set_long<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        self.set_with_ttl(key, value, self.config.long_ttl()).await
    }

    pub async fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        validate_key(key)?;
        let raw = encode(key, value)?;
        self.write_raw(key, &raw, ttl).await
    }

    /// Delete one key. Store failures are logged and reported as `false`.
    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        Ok(self.delete_quietly(key).await)
    }

    /// Delete several keys in one round trip, falling back to single deletes.
    pub async fn remove_many(&self, keys: &[String]) -> Result<u64, CacheError> {
        for key in keys {
            validate_key(key)?;
        }
        match self.try_remove_many(keys).await {
            Ok(removed) => Ok(removed),
            Err(error) => {
                counter!(METRIC_STORE_ERROR, "op" => "delete").increment(1);
                warn!(key_count = keys.len(), error = %error, "Cache removal failed");
                Ok(0)
            }
        }
    }

    pub(crate) async fn try_remove_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        delete_with_fallback(self.store.as_ref(), keys, self.deadline()).await
    }

    pub async fn remove_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        validate_key(pattern)?;
        Ok(self.scanner.delete_by_pattern(pattern).await)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        match bounded(self.deadline(), self.store.exists(key)).await {
            Ok(found) => Ok(found),
            Err(error) => {
                counter!(METRIC_STORE_ERROR, "op" => "exists").increment(1);
                debug!(key, error = %error, "Existence check failed");
                Ok(false)
            }
        }
    }

    /// Restart the default TTL window of `key` without rewriting it.
    pub async fn refresh(&self, key: &str) -> Result<bool, CacheError> {
        self.refresh_with_ttl(key, self.config.default_ttl()).await
    }

    pub async fn refresh_with_ttl(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        validate_key(key)?;
        match bounded(self.deadline(), self.store.refresh(key, ttl)).await {
            Ok(refreshed) => Ok(refreshed),
            Err(error) => {
                counter!(METRIC_STORE_ERROR, "op" => "refresh").increment(1);
                debug!(key, error = %error, "TTL refresh failed");
                Ok(false)
            }
        }
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        validate_key(pattern)?;
        Ok(self.scanner.keys(pattern).await)
    }

    /// Return the cached value for `key`, computing and caching it on a miss.
    ///
    /// Concurrent callers for the same key wait on one lock; the first runs
    /// `factory`, the rest find its result on their second read. A factory
    /// error reaches the caller after the lock is released and nothing is
    /// cached. A factory result of `None` is returned but not cached.
    ///
    /// If the lock cannot be obtained (timeout, registry closed) the value is
    /// computed without it. Cache write failures are logged, not returned.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        options: ComputeOptions,
        factory: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        validate_key(key)?;

        if let Some(hit) = self.get::<T>(key).await? {
            return Ok(Some(hit));
        }

        let guard = match self.locks.acquire(key, self.config.lock_timeout()).await {
            Ok(guard) => Some(guard),
            Err(error) => {
                warn!(key, error = %error, "Computing without key lock");
                None
            }
        };

        if guard.is_some()
            && let Some(hit) = self.get::<T>(key).await?
        {
            return Ok(Some(hit));
        }

        counter!(METRIC_COMPUTE).increment(1);
        let Some(value) = factory().await? else {
            debug!(key, "Factory produced no value; nothing cached");
            return Ok(None);
        };

        self.store_computed(key, &value, options).await;
        drop(guard);
        Ok(Some(value))
    }

    async fn store_computed<T: Serialize>(&self, key: &str, value: &T, options: ComputeOptions) {
        let raw = match encode(key, value) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(key, error = %error, "Computed value not cached");
                return;
            }
        };

        if options.skip_empty && is_empty_collection(&raw) {
            debug!(key, "Skipping cache write for empty collection");
            return;
        }

        let ttl = match options.ttl {
            Ttl::Default => self.config.default_ttl(),
            Ttl::Long => self.config.long_ttl(),
            Ttl::Exactly(ttl) => ttl,
        };
        if let Err(error) = self.write_raw(key, &raw, ttl).await {
            warn!(key, error = %error, "Failed to cache computed value");
        }
    }

    async fn write_raw(&self, key: &str, raw: &str, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::ZeroTtl {
                key: key.to_string(),
            });
        }
        bounded(self.deadline(), self.store.set_string(key, raw, ttl))
            .await
            .map_err(|error| {
                counter!(METRIC_STORE_ERROR, "op" => "set").increment(1);
                CacheError::store(key, error)
            })
    }

    async fn delete_quietly(&self, key: &str) -> bool {
        match bounded(self.deadline(), self.store.delete(key)).await {
            Ok(removed) => removed,
            Err(error) => {
                counter!(METRIC_STORE_ERROR, "op" => "delete").increment(1);
                warn!(key, error = %error, "Cache removal failed");
                false
            }
        }
    }

    fn deadline(&self) -> Duration {
        self.config.operation_timeout()
    }
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<String, CacheError> {
    let raw = serde_json::to_string(value).map_err(|source| CacheError::Serialization {
        key: key.to_string(),
        source,
    })?;
    if raw == "null" {
        return Err(CacheError::null_value(key));
    }
    Ok(raw)
}

fn is_empty_collection(raw: &str) -> bool {
    matches!(raw, "[]" | "{}")
}
