//! Configuration recognized by the storage core (spec §6).

use std::path::PathBuf;
use thiserror::Error;

/// The full set of configuration knobs the storage core reads. Every
/// field here is enumerated in spec.md §6; nothing else is recognized.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory backing the embedded KV store.
    pub storage_path: PathBuf,

    /// Upper bound on tree nodes emitted to disk per bucket. Trees
    /// exceeding it are pruned by dropping smallest leaves first.
    pub max_nodes_serialization: usize,

    /// Byte budget driving the segment store's eviction fraction.
    pub cache_segment_size: usize,

    /// Byte budget driving the tree store's eviction fraction.
    pub cache_tree_size: usize,

    /// Byte budget driving the dimension index's eviction fraction.
    pub cache_dimension_size: usize,

    /// Byte budget driving the dictionary's eviction fraction.
    pub cache_dictionary_size: usize,

    /// Informational only: retention policy is enforced by an external
    /// compactor calling `Delete`, not by the core itself.
    pub retention: Option<std::time::Duration>,

    /// How often the façade's periodic eviction task runs.
    pub eviction_interval: std::time::Duration,

    /// Fraction of each cache's entries evicted per periodic cycle.
    pub eviction_fraction: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./profilestore-data"),
            max_nodes_serialization: 16_384,
            cache_segment_size: 64 * 1024 * 1024,
            cache_tree_size: 256 * 1024 * 1024,
            cache_dimension_size: 32 * 1024 * 1024,
            cache_dictionary_size: 16 * 1024 * 1024,
            retention: None,
            eviction_interval: std::time::Duration::from_secs(20),
            eviction_fraction: 0.25,
        }
    }
}

/// Errors raised while validating a [`Config`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `eviction_fraction` was outside `(0.0, 1.0]`.
    #[error("eviction_fraction must be in (0.0, 1.0], got {0}")]
    InvalidEvictionFraction(String),

    /// A configured byte budget was zero.
    #[error("{0} must be greater than zero")]
    ZeroBudget(&'static str),
}

impl Config {
    /// Validate the configuration, returning the first violated
    /// constraint found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.eviction_fraction > 0.0 && self.eviction_fraction <= 1.0) {
            return Err(ConfigError::InvalidEvictionFraction(
                self.eviction_fraction.to_string(),
            ));
        }
        if self.cache_segment_size == 0 {
            return Err(ConfigError::ZeroBudget("cache_segment_size"));
        }
        if self.cache_tree_size == 0 {
            return Err(ConfigError::ZeroBudget("cache_tree_size"));
        }
        if self.cache_dimension_size == 0 {
            return Err(ConfigError::ZeroBudget("cache_dimension_size"));
        }
        if self.cache_dictionary_size == 0 {
            return Err(ConfigError::ZeroBudget("cache_dictionary_size"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_eviction_fraction() {
        let mut cfg = Config::default();
        cfg.eviction_fraction = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_budget() {
        let mut cfg = Config::default();
        cfg.cache_tree_size = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZeroBudget("cache_tree_size"))
        ));
    }
}
