//! Per-key mutual exclusion for stampede protection.
//!
//! One async mutex per cache key, created on first use and reclaimed once it
//! has been idle long enough. Insert-if-absent goes through the `DashMap` entry
//! API, so concurrent callers for the same key always share one lock object.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::error::LockError;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::key_locks";
const METRIC_KEY_LOCKS: &str = "cascade_cache_key_locks";

struct KeyLock {
    id: u64,
    mutex: Arc<AsyncMutex<()>>,
    /// Holders plus waiters. Only changed while the map shard is locked on the
    /// way in, so a sweep can never remove a lock somebody is about to use.
    users: AtomicUsize,
    last_used_ms: AtomicU64,
}

/// Keeps a lock registered as in use until dropped.
struct Lease {
    lock: Arc<KeyLock>,
    epoch: Instant,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.lock
            .last_used_ms
            .store(elapsed_ms(self.epoch), Ordering::SeqCst);
        self.lock.users.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive hold on one key. Dropping it releases the lock.
pub struct KeyLockGuard {
    // Field order matters: the mutex is released before the lease stops
    // counting this caller as a user.
    _guard: OwnedMutexGuard<()>,
    lease: Lease,
    key: String,
}

impl KeyLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identity of the underlying lock object. A key whose lock was reclaimed
    /// gets a fresh id on its next acquisition.
    pub fn lock_id(&self) -> u64 {
        self.lease.lock.id
    }

    pub fn release(self) {}
}

impl std::fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &self.key)
            .field("lock_id", &self.lock_id())
            .finish()
    }
}

struct Reclaimer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Registry of per-key locks with idle reclaim.
pub struct KeyLockRegistry {
    locks: DashMap<String, Arc<KeyLock>>,
    max_locks: usize,
    idle_timeout: Duration,
    epoch: Instant,
    next_id: AtomicU64,
    closed: AtomicBool,
    reclaimer: Mutex<Option<Reclaimer>>,
}

impl KeyLockRegistry {
    pub fn new(max_locks: usize, idle_timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            max_locks: max_locks.max(1),
            idle_timeout,
            epoch: Instant::now(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reclaimer: Mutex::new(None),
        }
    }

    /// Wait up to `wait` for exclusive access to `key`.
    pub async fn acquire(&self, key: &str, wait: Duration) -> Result<KeyLockGuard, LockError> {
        if self.is_closed() {
            return Err(LockError::Closed);
        }

        if self.locks.len() >= self.max_locks {
            let removed = self.reclaim_unheld();
            debug!(
                removed,
                capacity = self.max_locks,
                "Key lock registry at capacity, reclaimed unheld locks"
            );
        }

        let lease = {
            let entry = self.locks.entry(key.to_string()).or_insert_with(|| {
                Arc::new(KeyLock {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    mutex: Arc::new(AsyncMutex::new(())),
                    users: AtomicUsize::new(0),
                    last_used_ms: AtomicU64::new(elapsed_ms(self.epoch)),
                })
            });
            entry.users.fetch_add(1, Ordering::SeqCst);
            Lease {
                lock: Arc::clone(entry.value()),
                epoch: self.epoch,
            }
        };
        gauge!(METRIC_KEY_LOCKS).set(self.locks.len() as f64);

        // `close` may have cleared the map between the check above and insert.
        if self.is_closed() {
            self.locks.remove(key);
            return Err(LockError::Closed);
        }

        let mutex = Arc::clone(&lease.lock.mutex);
        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(KeyLockGuard {
                _guard: guard,
                lease,
                key: key.to_string(),
            }),
            Err(_) => Err(LockError::Timeout(wait)),
        }
    }

    /// Remove locks that are unheld and idle past the configured timeout.
    pub fn sweep(&self) -> usize {
        self.reclaim_idle(self.idle_timeout)
    }

    fn reclaim_unheld(&self) -> usize {
        self.reclaim_idle(Duration::ZERO)
    }

    fn reclaim_idle(&self, idle: Duration) -> usize {
        let now = elapsed_ms(self.epoch);
        let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        let mut removed = 0;
        self.locks.retain(|_, lock| {
            let in_use = lock.users.load(Ordering::SeqCst) > 0;
            let idle_for = now.saturating_sub(lock.last_used_ms.load(Ordering::SeqCst));
            let keep = in_use || (idle_ms > 0 && idle_for < idle_ms);
            if !keep {
                removed += 1;
            }
            keep
        });
        gauge!(METRIC_KEY_LOCKS).set(self.locks.len() as f64);
        removed
    }

    /// Start the periodic sweep. Calling it again while a sweep task is
    /// running has no effect.
    pub fn start_reclaimer(self: &Arc<Self>, interval: Duration) {
        let mut slot = mutex_lock(&self.reclaimer, SOURCE, "start_reclaimer");
        if slot.is_some() || self.is_closed() {
            return;
        }

        let (shutdown, mut stop) = watch::channel(false);
        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip the first immediate tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }

                let Some(registry) = registry.upgrade() else {
                    break;
                };
                match catch_unwind(AssertUnwindSafe(|| registry.sweep())) {
                    Ok(0) => {}
                    Ok(removed) => debug!(
                        removed,
                        remaining = registry.len(),
                        "Reclaimed idle key locks"
                    ),
                    Err(_) => error!("Key lock sweep panicked; will retry on next tick"),
                }
            }
        });

        *slot = Some(Reclaimer { shutdown, handle });
        info!(interval_secs = interval.as_secs(), "Key lock reclaimer started");
    }

    /// Stop the sweep task and drop every lock. Later acquisitions fail with
    /// [`LockError::Closed`]. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let reclaimer = mutex_lock(&self.reclaimer, SOURCE, "close").take();
        if let Some(reclaimer) = reclaimer {
            let _ = reclaimer.shutdown.send(true);
            if let Err(err) = reclaimer.handle.await {
                warn!(error = %err, "Key lock reclaimer ended abnormally");
            }
        }

        let dropped = self.locks.len();
        self.locks.clear();
        gauge!(METRIC_KEY_LOCKS).set(0.0);
        info!(dropped, "Key lock registry closed");
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_locks
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }
}

impl Drop for KeyLockRegistry {
    fn drop(&mut self) {
        let slot = match self.reclaimer.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reclaimer) = slot {
            reclaimer.handle.abort();
        }
    }
}

fn elapsed_ms(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}
