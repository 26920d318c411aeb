//! Invalidation orchestration.
//!
//! Executes [`InvalidationPlan`]s: the exact-key batch, every pattern and every
//! cascaded type run as concurrent branches. A failing branch is logged and
//! counted; it never fails the call.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use metrics::histogram;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::engine::CacheEngine;
use super::keys::EntityType;
use super::planner::{InvalidationContext, InvalidationPlan, InvalidationRequest};
use super::scanner::{PatternDeleteError, PatternScanner};

const METRIC_INVALIDATION_MS: &str = "cascade_cache_invalidation_ms";

/// Outcome of one orchestrated invalidation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Exact keys that existed and were deleted.
    pub keys_removed: u64,
    /// Keys deleted through wildcard patterns.
    pub pattern_keys_removed: u64,
    /// Dependent types invalidated type-wide.
    pub cascaded: BTreeSet<EntityType>,
    /// Branches that hit a store failure.
    pub failed_branches: usize,
}

impl InvalidationReport {
    pub fn total_removed(&self) -> u64 {
        self.keys_removed + self.pattern_keys_removed
    }

    pub fn is_clean(&self) -> bool {
        self.failed_branches == 0
    }

    fn absorb(&mut self, other: InvalidationReport) {
        self.keys_removed += other.keys_removed;
        self.pattern_keys_removed += other.pattern_keys_removed;
        self.cascaded.extend(other.cascaded);
        self.failed_branches += other.failed_branches;
    }
}

pub struct InvalidationOrchestrator {
    engine: Arc<CacheEngine>,
    scanner: Arc<PatternScanner>,
}

impl InvalidationOrchestrator {
    pub fn new(engine: Arc<CacheEngine>, scanner: Arc<PatternScanner>) -> Self {
        Self { engine, scanner }
    }

    /// Invalidate one entity (`id > 0`) or its whole type (`id` absent or
    /// `<= 0`), optionally cascading to dependent types.
    pub async fn invalidate_entity(
        &self,
        entity_type: EntityType,
        id: Option<i64>,
        cascade: bool,
    ) -> InvalidationReport {
        let request = InvalidationRequest {
            entity_type,
            entity_id: id,
            entity_key: None,
            cascade,
        };
        self.invalidate(&request).await
    }

    #[instrument(
        skip(self, request),
        fields(
            entity_type = %request.entity_type,
            entity_id = ?request.entity_id,
            entity_key = ?request.entity_key,
            cascade = request.cascade
        )
    )]
    pub async fn invalidate(&self, request: &InvalidationRequest) -> InvalidationReport {
        let plan = InvalidationPlan::for_request(request);
        self.execute(&plan).await
    }

    /// Invalidate a changed entity together with everything its relations
    /// and operation kind imply.
    #[instrument(
        skip(self, context),
        fields(
            entity_type = %context.entity_type,
            entity_id = context.entity_id,
            operation = %context.operation
        )
    )]
    pub async fn invalidate_related(&self, context: &InvalidationContext) -> InvalidationReport {
        let plan = InvalidationPlan::for_context(context);
        self.execute(&plan).await
    }

    /// Run [`invalidate_related`](Self::invalidate_related) in the background.
    ///
    /// The triggering write does not wait for it. The returned handle resolves
    /// once the invalidation has finished and its outcome has been logged,
    /// including a panic inside the invalidation task.
    pub fn spawn_related(self: &Arc<Self>, context: InvalidationContext) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let entity_type = context.entity_type;
        let entity_id = context.entity_id;
        let task = tokio::spawn(async move { orchestrator.invalidate_related(&context).await });

        tokio::spawn(async move {
            match task.await {
                Ok(report) if report.is_clean() => debug!(
                    %entity_type,
                    entity_id,
                    removed = report.total_removed(),
                    "Background invalidation complete"
                ),
                Ok(report) => warn!(
                    %entity_type,
                    entity_id,
                    failed_branches = report.failed_branches,
                    "Background invalidation finished with failures"
                ),
                Err(err) if err.is_panic() => error!(
                    %entity_type,
                    entity_id,
                    "Background invalidation panicked"
                ),
                Err(err) => warn!(
                    %entity_type,
                    entity_id,
                    error = %err,
                    "Background invalidation cancelled"
                ),
            }
        })
    }

    pub fn plan_entity(
        &self,
        entity_type: EntityType,
        id: Option<i64>,
        cascade: bool,
    ) -> InvalidationPlan {
        InvalidationPlan::for_request(&InvalidationRequest {
            entity_type,
            entity_id: id,
            entity_key: None,
            cascade,
        })
    }

    pub fn plan_related(&self, context: &InvalidationContext) -> InvalidationPlan {
        InvalidationPlan::for_context(context)
    }

    /// Flush every key in the store.
    pub async fn clear_all(&self) -> u64 {
        let removed = self.scanner.clear_all().await;
        info!(removed, "Cache flushed");
        removed
    }

    async fn execute(&self, plan: &InvalidationPlan) -> InvalidationReport {
        let started_at = Instant::now();
        debug!(%plan, "Executing invalidation plan");

        let mut branches: Vec<BoxFuture<'_, InvalidationReport>> =
            vec![self.run_direct(plan).boxed()];
        for &entity_type in &plan.cascades {
            branches.push(self.run_cascade(entity_type).boxed());
        }

        let mut report = InvalidationReport::default();
        for branch in join_all(branches).await {
            report.absorb(branch);
        }

        histogram!(METRIC_INVALIDATION_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        if report.is_clean() {
            info!(
                keys_removed = report.keys_removed,
                pattern_keys_removed = report.pattern_keys_removed,
                cascaded = report.cascaded.len(),
                "Invalidation complete"
            );
        } else {
            warn!(
                keys_removed = report.keys_removed,
                pattern_keys_removed = report.pattern_keys_removed,
                failed_branches = report.failed_branches,
                "Invalidation completed with failures"
            );
        }
        report
    }

    async fn run_cascade(&self, entity_type: EntityType) -> InvalidationReport {
        let plan = InvalidationPlan::type_wide(entity_type);
        let mut report = self.run_direct(&plan).await;
        report.cascaded.insert(entity_type);
        report
    }

    /// Keys and patterns of `plan`, ignoring its cascades.
    async fn run_direct(&self, plan: &InvalidationPlan) -> InvalidationReport {
        let mut branches: Vec<BoxFuture<'_, InvalidationReport>> = Vec::new();
        if !plan.keys.is_empty() {
            let keys: Vec<String> = plan.keys.iter().cloned().collect();
            branches.push(self.remove_keys(keys).boxed());
        }
        for pattern in &plan.patterns {
            branches.push(self.remove_pattern(pattern).boxed());
        }

        let mut report = InvalidationReport::default();
        for branch in join_all(branches).await {
            report.absorb(branch);
        }
        report
    }

    async fn remove_keys(&self, keys: Vec<String>) -> InvalidationReport {
        match self.engine.try_remove_many(&keys).await {
            Ok(removed) => InvalidationReport {
                keys_removed: removed,
                ..Default::default()
            },
            Err(error) => {
                warn!(keys = ?keys, error = %error, "Key invalidation failed");
                InvalidationReport {
                    failed_branches: 1,
                    ..Default::default()
                }
            }
        }
    }

    async fn remove_pattern(&self, pattern: &str) -> InvalidationReport {
        match self.scanner.try_delete_by_pattern(pattern).await {
            Ok(removed) => InvalidationReport {
                pattern_keys_removed: removed,
                ..Default::default()
            },
            Err(PatternDeleteError { removed, source }) => {
                warn!(pattern, removed, error = %source, "Pattern invalidation failed");
                InvalidationReport {
                    pattern_keys_removed: removed,
                    failed_branches: 1,
                    ..Default::default()
                }
            }
        }
    }
}
