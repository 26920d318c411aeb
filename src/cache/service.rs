//! Cache service facade.
//!
//! Wires the store, lock registry, scanner, engine, orchestrator and
//! diagnostics together and exposes them as one API. Create it at startup,
//! call [`CacheService::start`] inside the runtime and [`CacheService::close`]
//! during shutdown.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;

use super::config::CacheConfig;
use super::engine::{CacheEngine, ComputeOptions};
use super::error::CacheError;
use super::invalidation::{InvalidationOrchestrator, InvalidationReport};
use super::key_locks::KeyLockRegistry;
use super::keys::{EntityType, generate_key};
use super::planner::{InvalidationContext, InvalidationPlan, InvalidationRequest};
use super::scanner::PatternScanner;
use super::stats::Diagnostics;
use super::store::CacheStore;

pub struct CacheService {
    config: CacheConfig,
    locks: Arc<KeyLockRegistry>,
    engine: Arc<CacheEngine>,
    orchestrator: Arc<InvalidationOrchestrator>,
    diagnostics: Diagnostics,
}

impl CacheService {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        let locks = Arc::new(KeyLockRegistry::new(
            config.max_key_locks_non_zero(),
            config.lock_idle_timeout(),
        ));
        let scanner = Arc::new(PatternScanner::new(
            Arc::clone(&store),
            config.scan_batch_size_non_zero(),
            config.operation_timeout(),
        ));
        let engine = Arc::new(CacheEngine::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&scanner),
            config.clone(),
        ));
        let orchestrator = Arc::new(InvalidationOrchestrator::new(
            Arc::clone(&engine),
            Arc::clone(&scanner),
        ));
        let diagnostics = Diagnostics::new(
            store,
            scanner,
            Arc::clone(&locks),
            config.operation_timeout(),
        );

        Self {
            config,
            locks,
            engine,
            orchestrator,
            diagnostics,
        }
    }

    /// Start background maintenance (the idle lock sweep). Must be called
    /// from within a Tokio runtime.
    pub fn start(&self) {
        self.locks
            .start_reclaimer(self.config.lock_reclaim_interval());
    }

    /// Stop background maintenance and drop every key lock.
    pub async fn close(&self) {
        self.locks.close().await;
        info!("Cache service closed");
    }

    pub fn key_locks(&self) -> &Arc<KeyLockRegistry> {
        &self.locks
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        self.engine.get(key).await
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.engine.set(key, value).await
    }

    pub async fn set_long<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        self.engine.set_long(key, value).await
    }

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
        self.engine.get_or_compute(key, options, factory).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        self.engine.remove(key).await
    }

    pub async fn remove_many(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.engine.remove_many(keys).await
    }

    pub async fn remove_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        self.engine.remove_by_pattern(pattern).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.engine.exists(key).await
    }

    pub async fn refresh(&self, key: &str) -> Result<bool, CacheError> {
        self.engine.refresh(key).await
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.engine.keys(pattern).await
    }

    pub fn generate_key(&self, prefix: &str, parts: &[&dyn fmt::Display]) -> String {
        generate_key(prefix, parts)
    }

    pub async fn invalidate_entity(
        &self,
        entity_type: EntityType,
        id: Option<i64>,
        cascade: bool,
    ) -> InvalidationReport {
        self.orchestrator
            .invalidate_entity(entity_type, id, cascade)
            .await
    }

    pub async fn invalidate(&self, request: &InvalidationRequest) -> InvalidationReport {
        self.orchestrator.invalidate(request).await
    }

    pub async fn invalidate_related(&self, context: &InvalidationContext) -> InvalidationReport {
        self.orchestrator.invalidate_related(context).await
    }

    pub fn spawn_related(&self, context: InvalidationContext) -> JoinHandle<()> {
        self.orchestrator.spawn_related(context)
    }

    pub fn plan_entity(
        &self,
        entity_type: EntityType,
        id: Option<i64>,
        cascade: bool,
    ) -> InvalidationPlan {
        self.orchestrator.plan_entity(entity_type, id, cascade)
    }

    pub fn plan_related(&self, context: &InvalidationContext) -> InvalidationPlan {
        self.orchestrator.plan_related(context)
    }

    pub async fn clear_all(&self) -> u64 {
        self.orchestrator.clear_all().await
    }

    pub async fn statistics(&self) -> BTreeMap<String, Value> {
        self.diagnostics.statistics().await
    }
}
