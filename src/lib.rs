//! Continuous CPU profiling storage core.
//!
//! This crate is a thin façade re-exporting [`profilestore_engine`]'s
//! public surface, mirroring the workspace's leaf-first layering:
//! [`profilestore_core`] (shared types), [`profilestore_storage`]
//! (backend + cache), [`profilestore_concurrency`] (locking +
//! eviction), [`profilestore_engine`] (dictionary, tree store, segment
//! tree, dimension index, façade).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use profilestore_core::{
    bucket_duration, round_half_even, Config, ConfigError, Error, KeyError, NoopRecorder,
    Recorder, Result, SeriesKey, MAX_LEVEL,
};
pub use profilestore_engine::{
    DeleteInput, Dictionary, DimensionIndex, GetInput, GetOutput, PutInput, Segment,
    SegmentStore, Stack, Storage, TimelineSample, Tree, TreeNode, TreeStore,
};
