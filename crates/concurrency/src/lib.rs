//! Concurrency primitives for the profile storage core (spec §5):
//! per-series locking and the periodic eviction scheduler.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod eviction;
pub mod series_lock;

pub use eviction::EvictionScheduler;
pub use series_lock::SeriesLockManager;
