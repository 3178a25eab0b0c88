//! Per-series mutex manager (spec §5).
//!
//! Segment-tree updates for a given series must be serialized by a
//! per-series mutex, acquired before the `E.Put`/`E.Get`/`E.Delete`
//! critical section and released only after the associated tree-store
//! mutations complete. This gives per-series linearizability and
//! read-your-writes without a single global lock.
//!
//! One mutex per shard key in a `DashMap<String, Mutex<()>>` so unrelated
//! series never contend on the same lock.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Hands out one mutex per series key, created lazily on first use and
/// retained for the lifetime of the manager so repeat callers on the
/// same series always serialize against each other.
#[derive(Default)]
pub struct SeriesLockManager {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SeriesLockManager {
    /// Create an empty lock manager.
    pub fn new() -> Self {
        SeriesLockManager {
            locks: DashMap::new(),
        }
    }

    /// Run `f` while holding the mutex for `segkey`. Two calls for
    /// different `segkey`s never block each other; two calls for the
    /// same `segkey` are fully serialized.
    pub fn with_series_lock<R>(&self, segkey: &str, f: impl FnOnce() -> R) -> R {
        let mutex = self
            .locks
            .entry(segkey.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = mutex.lock();
        f()
    }

    /// Number of distinct series currently holding an allocated lock
    /// slot. Locks are never removed once allocated (unbounded but
    /// bounded in practice by the number of distinct live series).
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no series has ever acquired a lock through this manager.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn serializes_access_to_the_same_series() {
        let mgr = Arc::new(SeriesLockManager::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                let counter = counter.clone();
                let max_concurrent = max_concurrent.clone();
                thread::spawn(move || {
                    mgr.with_series_lock("series-a", || {
                        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(std::time::Duration::from_millis(5));
                        counter.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_series_do_not_contend() {
        let mgr = Arc::new(SeriesLockManager::new());
        mgr.with_series_lock("a", || {});
        mgr.with_series_lock("b", || {});
        assert_eq!(mgr.len(), 2);
    }
}
