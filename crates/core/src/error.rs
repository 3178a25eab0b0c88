//! Error types for the profile storage core.
//!
//! This is the stable error taxonomy shared by every crate in the
//! workspace. We use `thiserror` for automatic `Display`/`Error` impls.
//!
//! ## Error Categories
//!
//! - [`Error::InvalidKey`]: malformed series key syntax
//! - [`Error::Missing`]: entry absent from both cache and backend (only
//!   returned where the cache has no `new_default` factory; callers that
//!   go through the façade instead see `Ok(None)`)
//! - [`Error::CorruptEntry`]: byte-level decode failure or version mismatch
//! - [`Error::BackendError`]: I/O/transaction failure from the backend adapter
//! - [`Error::Closed`]: operation attempted after `Close`

use std::io;
use thiserror::Error;

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error taxonomy for the profile storage core (spec §7).
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed series key syntax (spec §6: `name{k=v,...}`).
    #[error("invalid series key: {0}")]
    InvalidKey(String),

    /// Entry absent from both cache and backend, and no default factory
    /// was configured to synthesize one.
    #[error("missing entry: {0}")]
    Missing(String),

    /// Byte-level decode failure or an on-disk format version mismatch.
    #[error("corrupt entry: {0}")]
    CorruptEntry(String),

    /// I/O or transaction failure from the backend adapter.
    #[error("backend error: {0}")]
    BackendError(String),

    /// Operation attempted after the store was closed.
    #[error("operation attempted after close")]
    Closed,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl Error {
    /// True if this error represents on-disk corruption that the engine
    /// must not attempt to silently repair (spec §7 policy).
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Error::CorruptEntry(_))
    }
}
