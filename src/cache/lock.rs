use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// In-process cache state is either rebuildable (the memory store) or a
/// bookkeeping slot (the reclaim task handle), so continuing with possibly
/// stale contents is preferable to propagating the panic to every caller.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "Recovered from poisoned cache mutex"
            );
            poisoned.into_inner()
        }
    }
}
