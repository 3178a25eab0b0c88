//! Shared types for the profile storage core.
//!
//! This crate defines the foundational types used throughout the engine:
//! - [`Error`] / [`Result`]: the stable error taxonomy
//! - [`SeriesKey`]: canonical `app{k=v,...}` series identity
//! - [`grid`]: the power-of-two time-bucket grid shared by the segment tree
//! - [`Config`]: the enumerated configuration surface
//! - [`Recorder`]: an injectable metrics sink

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod grid;
pub mod key;
pub mod recorder;

pub use config::{Config, ConfigError};
pub use error::{Error, Result};
pub use grid::{bucket_duration, round_half_even, round_range_to_grid, MAX_LEVEL};
pub use key::{KeyError, SeriesKey};
pub use recorder::{NoopRecorder, Recorder};
