//! Injectable metrics recorder (spec §9: "wrap global mutable process
//! state in an injectable recorder interface").

/// Sink for the named counters the cache layer and façade publish:
/// `cache_<name>_hit`, `cache_<name>_miss`, `storage_<name>_read`,
/// `storage_<name>_write`, `storage_<name>_write_err`.
///
/// Implementors must be `Send + Sync`: the recorder is shared across the
/// eviction worker thread and every caller thread.
pub trait Recorder: Send + Sync {
    /// Increment the named counter by `delta`.
    fn count(&self, name: &str, delta: u64);
}

/// A [`Recorder`] that discards everything. The default when no recorder
/// is supplied at construction.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl Recorder for NoopRecorder {
    fn count(&self, _name: &str, _delta: u64) {}
}
