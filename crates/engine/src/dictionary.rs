//! Stack dictionary (spec §4.C): a bidirectional, append-only
//! `string <-> u64` interning table. Ids are assigned from 1 upwards on
//! first sight; 0 is reserved and never assigned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use profilestore_core::{Error, NoopRecorder, Recorder, Result};
use profilestore_storage::{Backend, Cache, CacheConfig};

const COUNTER_KEY: &[u8] = b"m:counter";
const BY_STRING_PREFIX: &[u8] = b"v:";
const BY_ID_PREFIX: &[u8] = b"i:";

/// Fixed-width big-endian encoding of a `u64` id, used as the `by_id`
/// cache's key type (the generic [`Cache`] requires `K: AsRef<[u8]>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdKey([u8; 8]);

impl IdKey {
    fn new(id: u64) -> Self {
        IdKey(id.to_be_bytes())
    }

    fn id(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl AsRef<[u8]> for IdKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Bidirectional `label-string <-> id` interning table (spec §4.C).
///
/// Id allocation is serialized by an internal mutex; lookups go through
/// the cache layer and are concurrent-safe.
pub struct Dictionary {
    by_string: Cache<String, u64>,
    by_id: Cache<IdKey, String>,
    counter: AtomicU64,
    alloc: Mutex<()>,
    backend: Arc<Backend>,
}

impl Dictionary {
    /// Open the dictionary on `backend`, restoring the monotonic counter
    /// from its reserved backend key if present.
    pub fn open(backend: Arc<Backend>) -> Result<Self> {
        Self::open_with_recorder(backend, Arc::new(NoopRecorder))
    }

    /// Open the dictionary with an injected [`Recorder`].
    pub fn open_with_recorder(backend: Arc<Backend>, recorder: Arc<dyn Recorder>) -> Result<Self> {
        let counter = match backend.get(COUNTER_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| Error::CorruptEntry("dictionary counter".to_string()))?;
                u64::from_be_bytes(arr)
            }
            None => 0,
        };

        let by_string = Cache::new(
            CacheConfig {
                name: "dict_by_string".to_string(),
                prefix: BY_STRING_PREFIX.to_vec(),
                serialize: Arc::new(|_k: &String, v: &u64| v.to_be_bytes().to_vec()),
                deserialize: Arc::new(|bytes| {
                    let arr: [u8; 8] = bytes
                        .try_into()
                        .map_err(|_| Error::CorruptEntry("dictionary id".to_string()))?;
                    Ok(u64::from_be_bytes(arr))
                }),
                new_default: None,
                always_save: false,
            },
            backend.clone(),
            recorder.clone(),
        );

        let by_id = Cache::new(
            CacheConfig {
                name: "dict_by_id".to_string(),
                prefix: BY_ID_PREFIX.to_vec(),
                serialize: Arc::new(|_k: &IdKey, v: &String| v.as_bytes().to_vec()),
                deserialize: Arc::new(|bytes| {
                    String::from_utf8(bytes.to_vec())
                        .map_err(|_| Error::CorruptEntry("dictionary label".to_string()))
                }),
                new_default: None,
                always_save: false,
            },
            backend.clone(),
            recorder,
        );

        Ok(Dictionary {
            by_string,
            by_id,
            counter: AtomicU64::new(counter),
            alloc: Mutex::new(()),
            backend,
        })
    }

    /// Intern `s`, returning its id. Idempotent: repeated calls for the
    /// same string return the same id (spec §4.C, P3).
    pub fn put(&self, s: &str) -> Result<u64> {
        if let Some(id) = self.lookup_string(s)? {
            return Ok(id);
        }
        let _guard = self.alloc.lock();
        // Re-check: another thread may have allocated while we waited.
        if let Some(id) = self.lookup_string(s)? {
            return Ok(id);
        }
        let id = self.allocate_id()?;
        self.by_string.put(s.to_string(), id)?;
        self.by_id.put(IdKey::new(id), s.to_string())?;
        Ok(id)
    }

    /// Resolve `id` back to its string, or `None` if never assigned.
    pub fn get(&self, id: u64) -> Result<Option<String>> {
        match self.by_id.get(&IdKey::new(id)) {
            Ok(s) => Ok(Some(s)),
            Err(Error::Missing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Flush both underlying caches.
    pub fn flush(&self) {
        self.by_string.flush();
        self.by_id.flush();
    }

    fn lookup_string(&self, s: &str) -> Result<Option<u64>> {
        match self.by_string.get(&s.to_string()) {
            Ok(id) => Ok(Some(id)),
            Err(Error::Missing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn allocate_id(&self) -> Result<u64> {
        let next = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.backend.put(COUNTER_KEY, &next.to_be_bytes())?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_dict() -> (tempfile::TempDir, Dictionary) {
        let dir = tempdir().unwrap();
        let backend = Arc::new(Backend::open(dir.path()).unwrap());
        (dir, Dictionary::open(backend).unwrap())
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, dict) = open_dict();
        let id1 = dict.put("main.main").unwrap();
        let id2 = dict.put("main.main").unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn ids_are_monotonically_increasing_and_never_zero() {
        let (_dir, dict) = open_dict();
        let a = dict.put("a").unwrap();
        let b = dict.put("b").unwrap();
        let c = dict.put("c").unwrap();
        assert!(a >= 1 && b > a && c > b);
    }

    #[test]
    fn get_resolves_interned_string() {
        let (_dir, dict) = open_dict();
        let id = dict.put("runtime.gc").unwrap();
        assert_eq!(dict.get(id).unwrap().as_deref(), Some("runtime.gc"));
    }

    #[test]
    fn get_unknown_id_is_none() {
        let (_dir, dict) = open_dict();
        assert_eq!(dict.get(9999).unwrap(), None);
    }

    #[test]
    fn counter_survives_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(Backend::open(dir.path()).unwrap());
        let id;
        {
            let dict = Dictionary::open(backend.clone()).unwrap();
            id = dict.put("a").unwrap();
            dict.flush();
            backend.sync().unwrap();
        }
        let backend2 = Arc::new(Backend::open(dir.path()).unwrap());
        let dict2 = Dictionary::open(backend2).unwrap();
        assert_eq!(dict2.get(id).unwrap().as_deref(), Some("a"));
        // The next allocation must not reuse `id`.
        let next = dict2.put("b").unwrap();
        assert_ne!(next, id);
    }
}
