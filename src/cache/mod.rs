//! Cascade cache
//!
//! Cache-aside access to a remote key-value store with per-key stampede
//! protection, wildcard purges and cascading entity invalidation:
//!
//! - **Engine**: get / set / get-or-compute with fail-open reads
//! - **Key locks**: one async mutex per key, reclaimed when idle
//! - **Scanner**: batched delete-by-pattern under one process-wide mutex
//! - **Orchestrator**: entity change → keys, patterns and dependent types
//! - **Diagnostics**: key counts and lock occupancy
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! default_ttl_minutes = 30
//! long_ttl_hours = 24
//! max_key_locks = 10000
//! # ... see config.rs for all options
//! ```

mod config;
mod engine;
mod error;
mod invalidation;
mod key_locks;
mod keys;
mod lock;
mod memory;
mod planner;
mod scanner;
mod service;
mod stats;
mod store;

pub use config::CacheConfig;
pub use engine::{CacheEngine, ComputeOptions, Ttl};
pub use error::{CacheError, LockError, StoreError};
pub use invalidation::{InvalidationOrchestrator, InvalidationReport};
pub use key_locks::{KeyLockGuard, KeyLockRegistry};
pub use keys::{
    EntityType, KEY_DELIMITER, UnknownEntityType, generate_key, key_category, validate_key,
};
pub use memory::MemoryStore;
pub use planner::{
    InvalidationContext, InvalidationPlan, InvalidationRequest, OperationKind, Relation,
    cascade_targets,
};
pub use scanner::{MATCH_ALL, PatternDeleteError, PatternScanner};
pub use service::CacheService;
pub use stats::{Diagnostics, KEY_COUNT_LIMIT};
pub use store::{CacheStore, KeyStream};
