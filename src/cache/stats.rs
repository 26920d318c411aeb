//! Read-only cache diagnostics.
//!
//! Uses the store's `INFO` command when it is allowed and falls back to a
//! bounded key scan when it is not. A store that rejects admin commands is
//! asked exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};

use super::key_locks::KeyLockRegistry;
use super::keys::key_category;
use super::scanner::{MATCH_ALL, PatternScanner};
use super::store::{CacheStore, bounded};

/// Upper bound on keys visited by the scan-based key count.
pub const KEY_COUNT_LIMIT: usize = 100_000;

const ADMIN_UNKNOWN: u8 = 0;
const ADMIN_AVAILABLE: u8 = 1;
const ADMIN_UNAVAILABLE: u8 = 2;

const INFO_FIELDS: &[&str] = &[
    "redis_version",
    "uptime_in_seconds",
    "connected_clients",
    "used_memory",
    "used_memory_human",
    "maxmemory_policy",
    "keyspace_hits",
    "keyspace_misses",
    "evicted_keys",
];

pub struct Diagnostics {
    store: Arc<dyn CacheStore>,
    scanner: Arc<PatternScanner>,
    locks: Arc<KeyLockRegistry>,
    deadline: Duration,
    admin: AtomicU8,
}

impl Diagnostics {
    pub fn new(
        store: Arc<dyn CacheStore>,
        scanner: Arc<PatternScanner>,
        locks: Arc<KeyLockRegistry>,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            scanner,
            locks,
            deadline,
            admin: AtomicU8::new(ADMIN_UNKNOWN),
        }
    }

    /// Snapshot of store size, key counts per category and lock registry
    /// occupancy. Never fails; unavailable figures are omitted.
    pub async fn statistics(&self) -> BTreeMap<String, Value> {
        let mut stats = BTreeMap::new();
        stats.insert("key_locks".to_string(), json!(self.locks.len()));
        stats.insert("key_lock_capacity".to_string(), json!(self.locks.capacity()));
        stats.insert("key_locks_closed".to_string(), json!(self.locks.is_closed()));

        let admin_info = self.admin_info().await;
        stats.insert("admin_commands".to_string(), json!(self.admin_state()));

        let scanned = self
            .scanner
            .try_keys(MATCH_ALL, Some(KEY_COUNT_LIMIT))
            .await;
        let (keys, scan_complete) = match scanned {
            Ok(keys) => {
                let complete = keys.len() < KEY_COUNT_LIMIT;
                (keys, complete)
            }
            Err((partial, error)) => {
                warn!(error = %error, scanned = partial.len(), "Key scan for statistics failed");
                (partial, false)
            }
        };

        let mut by_category: BTreeMap<String, u64> = BTreeMap::new();
        for key in &keys {
            *by_category.entry(key_category(key).to_string()).or_default() += 1;
        }
        stats.insert("keys_by_category".to_string(), json!(by_category));
        stats.insert("keys_truncated".to_string(), json!(!scan_complete));

        match admin_info {
            Some(raw) => {
                let summary = summarize_info(&raw);
                let total = keyspace_total(&raw).unwrap_or(keys.len() as u64);
                stats.insert("mode".to_string(), json!("admin"));
                stats.insert("total_keys".to_string(), json!(total));
                stats.insert("store_info".to_string(), json!(summary));
            }
            None => {
                stats.insert("mode".to_string(), json!("scan"));
                stats.insert("total_keys".to_string(), json!(keys.len()));
            }
        }

        stats
    }

    /// `available`, `unavailable` or `unknown` (not probed yet).
    pub fn admin_state(&self) -> &'static str {
        match self.admin.load(Ordering::SeqCst) {
            ADMIN_AVAILABLE => "available",
            ADMIN_UNAVAILABLE => "unavailable",
            _ => "unknown",
        }
    }

    async fn admin_info(&self) -> Option<String> {
        if self.admin.load(Ordering::SeqCst) == ADMIN_UNAVAILABLE {
            return None;
        }

        match bounded(self.deadline, self.store.execute_admin_command("INFO")).await {
            Ok(raw) => {
                self.admin.store(ADMIN_AVAILABLE, Ordering::SeqCst);
                Some(raw)
            }
            Err(error) if error.is_unsupported() => {
                if self.admin.swap(ADMIN_UNAVAILABLE, Ordering::SeqCst) != ADMIN_UNAVAILABLE {
                    info!(
                        error = %error,
                        "Admin commands unavailable; using scan-based statistics"
                    );
                }
                None
            }
            Err(error) => {
                warn!(error = %error, "INFO failed; falling back to scan-based statistics");
                None
            }
        }
    }
}

/// Selected `field:value` pairs of an `INFO` reply.
fn summarize_info(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .filter_map(|line| line.trim().split_once(':'))
        .filter(|(field, _)| INFO_FIELDS.contains(field))
        .map(|(field, value)| (field.to_string(), value.to_string()))
        .collect()
}

/// Sum of `keys=N` over the `dbN:` lines of an `INFO` keyspace section.
fn keyspace_total(raw: &str) -> Option<u64> {
    let counts: Vec<u64> = raw
        .lines()
        .filter_map(|line| {
            let (db, fields) = line.trim().split_once(':')?;
            if !db.starts_with("db") {
                return None;
            }
            fields
                .split(',')
                .find_map(|field| field.strip_prefix("keys="))
                .and_then(|count| count.parse().ok())
        })
        .collect();
    (!counts.is_empty()).then(|| counts.iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    async fn diagnostics(keys: &[&str]) -> (Arc<MemoryStore>, Diagnostics) {
        let store = Arc::new(MemoryStore::new());
        for key in keys {
            store
                .set_string(key, "1", Duration::from_secs(60))
                .await
                .expect("seed");
        }
        let scanner = Arc::new(PatternScanner::new(store.clone(), 100, Duration::from_secs(1)));
        let locks = Arc::new(KeyLockRegistry::new(50, Duration::from_secs(300)));
        let diagnostics = Diagnostics::new(store.clone(), scanner, locks, Duration::from_secs(1));
        (store, diagnostics)
    }

    #[tokio::test]
    async fn scan_mode_counts_keys_by_category() {
        let (_, diagnostics) = diagnostics(&["page:1", "page:2", "user:1", "standalone"]).await;

        let stats = diagnostics.statistics().await;
        assert_eq!(stats["mode"], json!("scan"));
        assert_eq!(stats["total_keys"], json!(4));
        assert_eq!(
            stats["keys_by_category"],
            json!({"page": 2, "standalone": 1, "user": 1})
        );
        assert_eq!(stats["key_locks"], json!(0));
        assert_eq!(stats["key_lock_capacity"], json!(50));
        assert_eq!(stats["admin_commands"], json!("unavailable"));
    }

    #[tokio::test]
    async fn rejected_admin_command_is_not_retried() {
        let (store, diagnostics) = diagnostics(&["page:1"]).await;

        diagnostics.statistics().await;
        diagnostics.statistics().await;
        diagnostics.statistics().await;

        assert_eq!(store.admin_calls(), 1);
    }

    #[tokio::test]
    async fn transient_admin_failure_is_retried() {
        let (store, diagnostics) = diagnostics(&[]).await;
        store.enable_admin_commands(true);
        store.set_offline(true);

        let stats = diagnostics.statistics().await;
        assert_eq!(stats["mode"], json!("scan"));
        assert_eq!(diagnostics.admin_state(), "unknown");

        store.set_offline(false);
        let stats = diagnostics.statistics().await;
        assert_eq!(stats["mode"], json!("admin"));
        assert_eq!(store.admin_calls(), 2);
    }

    #[tokio::test]
    async fn admin_mode_reports_store_info() {
        let (store, diagnostics) = diagnostics(&["a:1", "a:2", "b:1"]).await;
        store.enable_admin_commands(true);

        let stats = diagnostics.statistics().await;
        assert_eq!(stats["mode"], json!("admin"));
        assert_eq!(stats["total_keys"], json!(3));
        assert_eq!(stats["store_info"]["redis_version"], json!("memory"));
        assert_eq!(diagnostics.admin_state(), "available");
    }

    #[test]
    fn parses_keyspace_lines() {
        let raw = "# Keyspace\r\ndb0:keys=12,expires=3,avg_ttl=0\r\ndb1:keys=5,expires=0\r\n";
        assert_eq!(keyspace_total(raw), Some(17));
        assert_eq!(keyspace_total("# Keyspace\r\n"), None);
    }

    #[test]
    fn summary_keeps_selected_fields() {
        let raw = concat!(
            "# Server\r\nredis_version:7.2.4\r\nos:Linux\r\n",
            "# Memory\r\nused_memory_human:1.5M\r\n",
        );
        let summary = summarize_info(raw);
        assert_eq!(summary.get("redis_version").map(String::as_str), Some("7.2.4"));
        assert_eq!(summary.get("used_memory_human").map(String::as_str), Some("1.5M"));
        assert!(!summary.contains_key("os"));
    }
}
