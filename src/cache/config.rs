//! Cache configuration.
//!
//! Controls TTL tiers, the key lock registry and pattern scanning. Built from
//! the validated `[cache]` settings section.

use std::time::Duration;

// Default values for cache configuration
const DEFAULT_TTL_MINUTES: u64 = 30;
const DEFAULT_LONG_TTL_HOURS: u64 = 24;
const DEFAULT_MAX_KEY_LOCKS: usize = 10_000;
const DEFAULT_LOCK_RECLAIM_INTERVAL_SECS: u64 = 120;
const DEFAULT_LOCK_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SCAN_BATCH_SIZE: usize = 1000;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5000;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

/// Runtime cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when a write does not name one.
    pub default_ttl_minutes: u64,
    /// TTL of the long-lived tier (`set_long`, `ComputeOptions::long`).
    pub long_ttl_hours: u64,
    /// Registry size that triggers an eager, synchronous reclaim.
    pub max_key_locks: usize,
    /// Period of the background idle-lock sweep.
    pub lock_reclaim_interval_secs: u64,
    /// How long an unheld lock may sit unused before the sweep drops it.
    pub lock_idle_timeout_secs: u64,
    /// Keys fetched and deleted per round trip during pattern deletes.
    pub scan_batch_size: usize,
    /// Deadline applied to every store call.
    pub operation_timeout_ms: u64,
    /// Upper bound on waiting for a per-key lock in `get_or_compute`.
    pub lock_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_minutes: DEFAULT_TTL_MINUTES,
            long_ttl_hours: DEFAULT_LONG_TTL_HOURS,
            max_key_locks: DEFAULT_MAX_KEY_LOCKS,
            lock_reclaim_interval_secs: DEFAULT_LOCK_RECLAIM_INTERVAL_SECS,
            lock_idle_timeout_secs: DEFAULT_LOCK_IDLE_TIMEOUT_SECS,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            default_ttl_minutes: settings.default_ttl_minutes.get(),
            long_ttl_hours: settings.long_ttl_hours.get(),
            max_key_locks: settings.max_key_locks.get(),
            lock_reclaim_interval_secs: settings.lock_reclaim_interval_secs.get(),
            lock_idle_timeout_secs: settings.lock_idle_timeout_secs.get(),
            scan_batch_size: settings.scan_batch_size.get(),
            operation_timeout_ms: settings.operation_timeout_ms.get(),
            lock_timeout_ms: settings.lock_timeout_ms.get(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_minutes.max(1).saturating_mul(60))
    }

    pub fn long_ttl(&self) -> Duration {
        Duration::from_secs(self.long_ttl_hours.max(1).saturating_mul(3600))
    }

    pub fn lock_reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.lock_reclaim_interval_secs.max(1))
    }

    pub fn lock_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_idle_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.max(1))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms.max(1))
    }

    /// Returns the scan batch size, clamping zero to one.
    pub fn scan_batch_size_non_zero(&self) -> usize {
        self.scan_batch_size.max(1)
    }

    /// Returns the lock ceiling, clamping zero to one.
    pub fn max_key_locks_non_zero(&self) -> usize {
        self.max_key_locks.max(1)
    }
}
