//! Backend adapter and cache/serialization layer for the profile storage
//! core (spec §4.A, §4.B).
//!
//! - [`backend::Backend`]: ordered, crash-recoverable KV adapter (A).
//! - [`cache::Cache`]: generic write-through LFU cache sitting in front
//!   of it (B).
//! - [`varint`]: LEB128 helpers shared by the segment and tree on-disk
//!   formats.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod cache;
pub mod varint;

pub use backend::Backend;
pub use cache::{Cache, CacheConfig, DeserializeFn, NewDefaultFn, SerializeFn};
