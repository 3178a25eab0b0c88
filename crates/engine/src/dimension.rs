//! Dimension/label inverted index (spec §4.F): maps `(label_name,
//! label_value)` to the set of canonical series-key strings that carry
//! it.

use std::collections::BTreeSet;
use std::sync::Arc;

use profilestore_core::{Error, NoopRecorder, Recorder, Result};
use profilestore_storage::varint::{read_uvarint, write_uvarint};
use profilestore_storage::{Backend, Cache, CacheConfig};

const DIMENSION_PREFIX: &[u8] = b"d:";

// Label names are restricted to `[A-Za-z0-9_.-]+` and values reject control
// characters, `,` and `}` (validated in the series-key parser), so a control
// byte makes an unambiguous separator even though either side may itself
// contain `-`.
const NAME_VALUE_SEP: char = '\u{1}';

fn dimension_key(label_name: &str, label_value: &str) -> String {
    format!("{label_name}{NAME_VALUE_SEP}{label_value}")
}

fn serialize_set(set: &BTreeSet<String>) -> Vec<u8> {
    let mut buf = Vec::new();
    write_uvarint(&mut buf, set.len() as u64);
    for s in set {
        write_uvarint(&mut buf, s.len() as u64);
        buf.extend_from_slice(s.as_bytes());
    }
    buf
}

fn deserialize_set(bytes: &[u8]) -> Result<BTreeSet<String>> {
    let mut pos = 0;
    let count = read_uvarint(bytes, &mut pos)?;
    let mut set = BTreeSet::new();
    for _ in 0..count {
        let len = read_uvarint(bytes, &mut pos)? as usize;
        let end = pos + len;
        let slice = bytes
            .get(pos..end)
            .ok_or_else(|| Error::CorruptEntry("truncated dimension entry".to_string()))?;
        let s = String::from_utf8(slice.to_vec())
            .map_err(|_| Error::CorruptEntry("dimension entry is not utf-8".to_string()))?;
        set.insert(s);
        pos = end;
    }
    Ok(set)
}

/// Inverted index from `(label_name, label_value)` to the series keys
/// that carry it (spec §4.F).
pub struct DimensionIndex {
    entries: Cache<String, BTreeSet<String>>,
    backend: Arc<Backend>,
}

impl DimensionIndex {
    /// Open the dimension index on `backend`.
    pub fn open(backend: Arc<Backend>) -> Self {
        Self::open_with_recorder(backend, Arc::new(NoopRecorder))
    }

    /// Open with an injected [`Recorder`].
    pub fn open_with_recorder(backend: Arc<Backend>, recorder: Arc<dyn Recorder>) -> Self {
        let entries = Cache::new(
            CacheConfig {
                name: "dimension_entries".to_string(),
                prefix: DIMENSION_PREFIX.to_vec(),
                serialize: Arc::new(|_k: &String, v: &BTreeSet<String>| serialize_set(v)),
                deserialize: Arc::new(|bytes| deserialize_set(bytes)),
                new_default: None,
                // `names`/`values` enumerate by prefix-scanning the
                // backend directly rather than the in-memory cache (spec
                // §4.F), so an entry must be written through as soon as
                // it changes or it would be invisible to enumeration
                // until the next eviction cycle.
                always_save: true,
            },
            backend.clone(),
            recorder,
        );
        DimensionIndex { entries, backend }
    }

    /// Add `series_key` to the set stored under `(label_name,
    /// label_value)`, creating the entry if needed.
    pub fn insert(&self, label_name: &str, label_value: &str, series_key: &str) -> Result<()> {
        let key = dimension_key(label_name, label_value);
        let mut set = match self.entries.get(&key) {
            Ok(set) => set,
            Err(Error::Missing(_)) => BTreeSet::new(),
            Err(e) => return Err(e),
        };
        set.insert(series_key.to_string());
        self.entries.put(key, set)
    }

    /// Remove `series_key` from the set stored under `(label_name,
    /// label_value)`. Absent is a no-op.
    pub fn delete(&self, label_name: &str, label_value: &str, series_key: &str) -> Result<()> {
        let key = dimension_key(label_name, label_value);
        match self.entries.get(&key) {
            Ok(mut set) => {
                set.remove(series_key);
                self.entries.put(key, set)
            }
            Err(Error::Missing(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The series keys stored under `(label_name, label_value)`.
    pub fn lookup(&self, label_name: &str, label_value: &str) -> Result<BTreeSet<String>> {
        let key = dimension_key(label_name, label_value);
        match self.entries.get(&key) {
            Ok(set) => Ok(set),
            Err(Error::Missing(_)) => Ok(BTreeSet::new()),
            Err(e) => Err(e),
        }
    }

    /// All distinct label names known to the index, via a prefix scan
    /// of the backend under `d:`.
    pub fn names(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        self.backend.prefix_scan(DIMENSION_PREFIX, |key, _value| {
            if let Ok(full) = std::str::from_utf8(&key[DIMENSION_PREFIX.len()..]) {
                if let Some((name, _value)) = full.split_once(NAME_VALUE_SEP) {
                    names.insert(name.to_string());
                }
            }
            true
        })?;
        Ok(names)
    }

    /// All distinct label values ever stored for `label_name`, via a
    /// prefix scan under `d:{label_name}-`.
    pub fn values(&self, label_name: &str) -> Result<BTreeSet<String>> {
        let mut values = BTreeSet::new();
        let scan_prefix = format!("{label_name}{NAME_VALUE_SEP}");
        let mut full_prefix = DIMENSION_PREFIX.to_vec();
        full_prefix.extend_from_slice(scan_prefix.as_bytes());
        self.backend.prefix_scan(&full_prefix, |key, _value| {
            if let Ok(full) = std::str::from_utf8(&key[DIMENSION_PREFIX.len()..]) {
                if let Some(value) = full.strip_prefix(scan_prefix.as_str()) {
                    values.insert(value.to_string());
                }
            }
            true
        })?;
        Ok(values)
    }

    /// Flush the underlying cache.
    pub fn flush(&self) {
        self.entries.flush();
    }
}
