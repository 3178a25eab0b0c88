//! The profiling storage engine (spec §4): dictionary, call-tree store,
//! segment tree, dimension index, and the [`Storage`] façade that
//! orchestrates them behind per-series locking.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dictionary;
pub mod dimension;
pub mod facade;
pub mod segment;
pub mod tree;

pub use dictionary::Dictionary;
pub use dimension::DimensionIndex;
pub use facade::{DeleteInput, GetInput, GetOutput, PutInput, Stack, Storage, TimelineSample};
pub use segment::{Segment, SegmentStore};
pub use tree::{Tree, TreeNode, TreeStore};
