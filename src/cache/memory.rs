//! In-process [`CacheStore`] used by tests and single-node development runs.
//!
//! Mirrors the observable behavior of the Redis client closely enough for the
//! cache layer: absolute TTLs, glob pattern scans, bulk deletes. Fault switches
//! let tests simulate an unreachable store or a failing bulk delete.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;

use super::error::StoreError;
use super::lock::mutex_lock;
use super::store::{CacheStore, KeyStream};

const SOURCE: &str = "cache::memory";

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Mutex-guarded ordered map with TTL bookkeeping.
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, StoredValue>>,
    offline: AtomicBool,
    bulk_deletes_fail: AtomicBool,
    admin_enabled: AtomicBool,
    endpoints: AtomicUsize,
    admin_calls: AtomicUsize,
    bulk_delete_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            offline: AtomicBool::new(false),
            bulk_deletes_fail: AtomicBool::new(false),
            admin_enabled: AtomicBool::new(false),
            endpoints: AtomicUsize::new(1),
            admin_calls: AtomicUsize::new(0),
            bulk_delete_calls: AtomicUsize::new(0),
        }
    }

    /// Make every call fail as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make `delete_many` fail while single-key deletes keep working.
    pub fn fail_bulk_deletes(&self, fail: bool) {
        self.bulk_deletes_fail.store(fail, Ordering::SeqCst);
    }

    /// Allow `INFO`/`DBSIZE`. Disabled by default, like a managed store that
    /// rejects privileged commands.
    pub fn enable_admin_commands(&self, enabled: bool) {
        self.admin_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_endpoint_count(&self, endpoints: usize) {
        self.endpoints.store(endpoints, Ordering::SeqCst);
    }

    /// Number of admin commands attempted so far.
    pub fn admin_calls(&self) -> usize {
        self.admin_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete_many` calls attempted so far.
    pub fn bulk_delete_calls(&self) -> usize {
        self.bulk_delete_calls.load(Ordering::SeqCst)
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        mutex_lock(&self.entries, SOURCE, "len")
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        mutex_lock(&self.entries, SOURCE, "ttl")
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now)
    }

    fn ensure_online(&self, command: &'static str) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::connection(format!(
                "memory store is offline ({command})"
            )));
        }
        Ok(())
    }

    fn remove_live(entries: &mut BTreeMap<String, StoredValue>, key: &str, now: Instant) -> bool {
        entries
            .remove(key)
            .is_some_and(|entry| entry.is_live(now))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_online("GET")?;
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "get_string");
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_online("SET")?;
        let entry = StoredValue {
            value: value.to_string(),
            expires_at: expiry(Instant::now(), ttl, "SET")?,
        };
        mutex_lock(&self.entries, SOURCE, "set_string").insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_online("DEL")?;
        let mut entries = mutex_lock(&self.entries, SOURCE, "delete");
        Ok(Self::remove_live(&mut entries, key, Instant::now()))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.bulk_delete_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online("DEL")?;
        if self.bulk_deletes_fail.load(Ordering::SeqCst) {
            return Err(StoreError::command("DEL", "bulk delete rejected"));
        }
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "delete_many");
        let removed = keys
            .iter()
            .filter(|key| Self::remove_live(&mut entries, key, now))
            .count();
        Ok(removed as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_online("EXISTS")?;
        let now = Instant::now();
        Ok(mutex_lock(&self.entries, SOURCE, "exists")
            .get(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.ensure_online("PEXPIRE")?;
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "refresh");
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = expiry(now, ttl, "PEXPIRE")?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn scan_keys<'a>(&'a self, pattern: &'a str, _page_size: usize) -> KeyStream<'a> {
        if let Err(error) = self.ensure_online("SCAN") {
            return futures::stream::once(async move { Err(error) }).boxed();
        }
        let now = Instant::now();
        let matched: Vec<Result<String, StoreError>> =
            mutex_lock(&self.entries, SOURCE, "scan_keys")
                .iter()
                .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
                .map(|(key, _)| Ok(key.clone()))
                .collect();
        futures::stream::iter(matched).boxed()
    }

    fn endpoint_count(&self) -> usize {
        self.endpoints.load(Ordering::SeqCst)
    }

    async fn execute_admin_command(&self, command: &str) -> Result<String, StoreError> {
        self.admin_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online("INFO")?;
        if !self.admin_enabled.load(Ordering::SeqCst) {
            return Err(StoreError::unsupported(
                "admin",
                format!("`{command}` is not permitted on this store"),
            ));
        }
        let live = self.len();
        match command.trim().to_ascii_uppercase().as_str() {
            "INFO" => Ok(format!(
                "# Server\r\nredis_version:memory\r\n# Memory\r\nused_memory:0\r\n\
                 # Keyspace\r\ndb0:keys={live},expires={live},avg_ttl=0\r\n"
            )),
            "DBSIZE" => Ok(live.to_string()),
            _ => Err(StoreError::command("ADMIN", format!("unknown command `{command}`"))),
        }
    }
}

fn expiry(now: Instant, ttl: Duration, command: &'static str) -> Result<Instant, StoreError> {
    now.checked_add(ttl)
        .ok_or_else(|| StoreError::command(command, format!("ttl {ttl:?} out of range")))
}

/// Redis-style glob matching: `*`, `?`, `[abc]`, `[^a-z]` and `\` escapes.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pi < pattern.len() && pattern[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
            continue;
        }
        if pi < pattern.len()
            && let Some(next) = match_single(&pattern, pi, text[ti])
        {
            pi = next;
            ti += 1;
            continue;
        }
        match backtrack {
            Some((star, consumed)) => {
                pi = star + 1;
                ti = consumed + 1;
                backtrack = Some((star, consumed + 1));
            }
            None => return false,
        }
    }

    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// Match one non-`*` pattern token at `pi` against `c`, returning the index of
/// the next token on success.
fn match_single(pattern: &[char], pi: usize, c: char) -> Option<usize> {
    match pattern[pi] {
        '?' => Some(pi + 1),
        '\\' if pi + 1 < pattern.len() => (pattern[pi + 1] == c).then_some(pi + 2),
        '[' => match class_end(pattern, pi) {
            Some(end) => class_contains(&pattern[pi + 1..end], c).then_some(end + 1),
            None => (c == '[').then_some(pi + 1),
        },
        literal => (literal == c).then_some(pi + 1),
    }
}

fn class_end(pattern: &[char], open: usize) -> Option<usize> {
    let mut j = open + 1;
    while j < pattern.len() {
        match pattern[j] {
            '\\' => j += 2,
            ']' => return Some(j),
            _ => j += 1,
        }
    }
    None
}

fn class_contains(class: &[char], c: char) -> bool {
    let (negated, class) = match class.first() {
        Some('^') => (true, &class[1..]),
        _ => (false, class),
    };

    let mut hit = false;
    let mut i = 0;
    while i < class.len() {
        if class[i] == '\\' && i + 1 < class.len() {
            hit |= class[i + 1] == c;
            i += 2;
        } else if i + 2 < class.len() && class[i + 1] == '-' {
            let (low, high) = if class[i] <= class[i + 2] {
                (class[i], class[i + 2])
            } else {
                (class[i + 2], class[i])
            };
            hit |= low <= c && c <= high;
            i += 3;
        } else {
            hit |= class[i] == c;
            i += 1;
        }
    }
    hit != negated
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    #[test]
    fn glob_star_and_question_mark() {
        assert!(glob_match("page:*", "page:1"));
        assert!(glob_match("page:*", "page:"));
        assert!(!glob_match("page:*", "pages:1"));
        assert!(glob_match("user:*:42", "user:profile:42"));
        assert!(!glob_match("user:*:42", "user:profile:420"));
        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "hllo"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn glob_classes_and_escapes() {
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("h[^e]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("id:[0-9]", "id:7"));
        assert!(!glob_match("id:[0-9]", "id:x"));
        assert!(glob_match("lit:\\*", "lit:*"));
        assert!(!glob_match("lit:\\*", "lit:x"));
    }

    #[tokio::test]
    async fn unrepresentable_ttl_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .set_string("page:1", "1", Duration::MAX)
            .await
            .expect_err("ttl overflows the clock");
        assert!(matches!(err, StoreError::Command { command: "SET", .. }));
        assert!(store.is_empty());

        store
            .set_string("page:1", "1", Duration::from_secs(60))
            .await
            .expect("set");
        assert!(store.refresh("page:1", Duration::MAX).await.is_err());
        assert!(store.ttl("page:1").expect("ttl") <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn set_get_delete_roundtrip() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        store.set_string("page:1", "{}", ttl).await.expect("set");
        assert_eq!(
            store.get_string("page:1").await.expect("get"),
            Some("{}".to_string())
        );
        assert!(store.delete("page:1").await.expect("delete"));
        assert!(!store.delete("page:1").await.expect("second delete"));
        assert_eq!(store.get_string("page:1").await.expect("get"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let store = MemoryStore::new();
        store
            .set_string("session:a", "x", Duration::from_secs(10))
            .await
            .expect("set");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.exists("session:a").await.expect("exists"));
        assert!(store.refresh("session:a", Duration::from_secs(10)).await.expect("refresh"));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.exists("session:a").await.expect("exists after refresh"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("session:a").await.expect("expired"));
        assert!(!store.refresh("session:a", Duration::from_secs(10)).await.expect("refresh"));
    }

    #[tokio::test]
    async fn scan_filters_by_pattern() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        for key in ["page:1", "page:2", "pages:all", "product:1"] {
            store.set_string(key, "v", ttl).await.expect("seed");
        }

        let keys: Vec<String> = store
            .scan_keys("page:*", 10)
            .try_collect()
            .await
            .expect("scan");
        assert_eq!(keys, vec!["page:1".to_string(), "page:2".to_string()]);
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_offline(true);

        assert!(store.get_string("k").await.is_err());
        assert!(store.set_string("k", "v", Duration::from_secs(1)).await.is_err());
        let scanned: Result<Vec<String>, _> = store.scan_keys("*", 10).try_collect().await;
        assert!(scanned.is_err());
    }

    #[tokio::test]
    async fn admin_commands_are_opt_in() {
        let store = MemoryStore::new();
        let denied = store.execute_admin_command("INFO").await;
        assert!(matches!(denied, Err(ref error) if error.is_unsupported()));

        store.enable_admin_commands(true);
        store
            .set_string("a", "1", Duration::from_secs(60))
            .await
            .expect("seed");
        let info = store.execute_admin_command("info").await.expect("info");
        assert!(info.contains("db0:keys=1"));
        assert_eq!(store.execute_admin_command("DBSIZE").await.expect("dbsize"), "1");
        assert_eq!(store.admin_calls(), 3);
    }
}
