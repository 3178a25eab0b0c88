//! Write-through LFU cache / serialization layer (spec §4.B).
//!
//! A single reusable type parameterized by `serialize`/`deserialize`/
//! `new_default` closures, sitting in front of a [`Backend`]. An LFU
//! table with unbounded logical capacity (bounding is externalized to
//! periodic [`Cache::evict`] calls), backed by a dedicated eviction
//! worker thread draining a bounded channel.
//!
//! Invariants (spec §4.B): (I1) an entry is at most once in the cache;
//! (I2) at most one serialization of a given key is in flight at a time
//! (the single worker thread is the only writer for this cache's
//! prefix); (I3) after [`Cache::flush`] returns, every live entry has
//! been written through; (I4) `get` after `put` with no intervening
//! `flush` returns the same logical value.

use std::hash::Hash;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::warn;

use profilestore_core::{Error, Recorder, Result};

use crate::backend::Backend;

/// Serializes a `(key, value)` pair for storage under the cache's
/// backend prefix.
pub type SerializeFn<K, V> = Arc<dyn Fn(&K, &V) -> Vec<u8> + Send + Sync>;
/// Deserializes bytes read back from the backend into a value.
pub type DeserializeFn<V> = Arc<dyn Fn(&[u8]) -> Result<V> + Send + Sync>;
/// Synthesizes a default value for a key absent from both cache and
/// backend. When unset, such a miss returns [`Error::Missing`].
pub type NewDefaultFn<K, V> = Arc<dyn Fn(&K) -> V + Send + Sync>;

const EVICTION_CHANNEL_CAPACITY: usize = 256;

struct Slot<V> {
    value: V,
    freq: u64,
    last_used: u64,
}

struct Slots<K, V> {
    entries: FxHashMap<K, Slot<V>>,
    tick: u64,
}

struct Shared<K, V> {
    name: String,
    prefix: Vec<u8>,
    serialize: SerializeFn<K, V>,
    deserialize: DeserializeFn<V>,
    new_default: Option<NewDefaultFn<K, V>>,
    always_save: bool,
    backend: Arc<Backend>,
    recorder: Arc<dyn Recorder>,
    slots: Mutex<Slots<K, V>>,
}

impl<K, V> Shared<K, V>
where
    K: AsRef<[u8]>,
{
    fn backend_key(&self, key: &K) -> Vec<u8> {
        let mut k = self.prefix.clone();
        k.extend_from_slice(key.as_ref());
        k
    }

    fn save_to_backend(&self, key: &K, value: &V) -> Result<()> {
        let bytes = (self.serialize)(key, value);
        self.backend.put(&self.backend_key(key), &bytes)
    }
}

/// Generic write-through LFU cache sitting in front of a [`Backend`]
/// (spec §4.B).
pub struct Cache<K, V> {
    shared: Arc<Shared<K, V>>,
    evict_tx: Mutex<Option<SyncSender<(K, V)>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Construction parameters for [`Cache::new`], grouped to keep the
/// constructor signature manageable.
pub struct CacheConfig<K, V> {
    /// Human-readable store name, used to compose counter names
    /// (`cache_<name>_hit`, `storage_<name>_write`, ...).
    pub name: String,
    /// Backend key prefix this cache's entries are written under.
    pub prefix: Vec<u8>,
    /// Serializes a value for on-disk storage.
    pub serialize: SerializeFn<K, V>,
    /// Deserializes a value read back from storage.
    pub deserialize: DeserializeFn<V>,
    /// Optional factory for entries absent from cache and backend.
    pub new_default: Option<NewDefaultFn<K, V>>,
    /// When true, every `put` is written through to the backend
    /// synchronously in addition to being cached (spec §9: default off).
    pub always_save: bool,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + AsRef<[u8]> + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Construct a cache in front of `backend`, starting its dedicated
    /// eviction worker thread.
    pub fn new(config: CacheConfig<K, V>, backend: Arc<Backend>, recorder: Arc<dyn Recorder>) -> Self {
        let shared = Arc::new(Shared {
            name: config.name,
            prefix: config.prefix,
            serialize: config.serialize,
            deserialize: config.deserialize,
            new_default: config.new_default,
            always_save: config.always_save,
            backend,
            recorder,
            slots: Mutex::new(Slots {
                entries: FxHashMap::default(),
                tick: 0,
            }),
        });

        let (tx, rx): (SyncSender<(K, V)>, Receiver<(K, V)>) =
            sync_channel(EVICTION_CHANNEL_CAPACITY);
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("cache-evict-{}", worker_shared.name))
            .spawn(move || eviction_worker(worker_shared, rx))
            .expect("failed to spawn cache eviction worker thread");

        Cache {
            shared,
            evict_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Fetch `key`. A cache hit bumps its frequency/recency and returns
    /// immediately. A miss falls through to the backend, and if that is
    /// also empty, to `new_default` (if configured); otherwise
    /// [`Error::Missing`].
    pub fn get(&self, key: &K) -> Result<V> {
        {
            let mut slots = self.shared.slots.lock();
            slots.tick += 1;
            let tick = slots.tick;
            if let Some(slot) = slots.entries.get_mut(key) {
                slot.freq += 1;
                slot.last_used = tick;
                self.shared.recorder.count(&format!("cache_{}_hit", self.shared.name), 1);
                return Ok(slot.value.clone());
            }
        }
        self.shared
            .recorder
            .count(&format!("cache_{}_miss", self.shared.name), 1);

        let backend_key = self.shared.backend_key(key);
        let from_backend = self.shared.backend.get(&backend_key)?;
        if let Some(bytes) = from_backend {
            self.shared
                .recorder
                .count(&format!("storage_{}_read", self.shared.name), 1);
            let value = (self.shared.deserialize)(&bytes).map_err(|_| {
                Error::CorruptEntry(format!("failed to deserialize {}", self.shared.name))
            })?;
            self.insert(key.clone(), value.clone());
            return Ok(value);
        }

        if let Some(new_default) = &self.shared.new_default {
            let value = new_default(key);
            self.insert(key.clone(), value.clone());
            return Ok(value);
        }

        Err(Error::Missing(self.shared.name.clone()))
    }

    /// Insert or replace `key`'s value. If `always_save` is set, the
    /// value is additionally written through to the backend immediately;
    /// otherwise durability is deferred to eviction or flush.
    pub fn put(&self, key: K, value: V) -> Result<()> {
        if self.shared.always_save {
            self.shared.save_to_backend(&key, &value)?;
        }
        self.insert(key, value);
        Ok(())
    }

    /// Remove `key` from both cache and backend. Absent is a no-op.
    pub fn delete(&self, key: &K) -> Result<()> {
        self.shared.slots.lock().entries.remove(key);
        self.shared.backend.delete(&self.shared.backend_key(key))
    }

    /// Push `floor(len * fraction)` least-frequently-used entries
    /// (ties broken least-recently-used) through the eviction pipe.
    pub fn evict(&self, fraction: f64) {
        let victims = {
            let mut slots = self.shared.slots.lock();
            let n = ((slots.entries.len() as f64) * fraction).floor() as usize;
            if n == 0 {
                return;
            }
            let mut ranked: Vec<(K, u64, u64)> = slots
                .entries
                .iter()
                .map(|(k, s)| (k.clone(), s.freq, s.last_used))
                .collect();
            ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
            ranked.truncate(n);
            let mut victims = Vec::with_capacity(ranked.len());
            for (k, _, _) in ranked {
                if let Some(slot) = slots.entries.remove(&k) {
                    victims.push((k, slot.value));
                }
            }
            victims
        };

        let tx_guard = self.evict_tx.lock();
        if let Some(tx) = tx_guard.as_ref() {
            for item in victims {
                // Bounded send: blocks (backpressure) if the worker is behind.
                let _ = tx.send(item);
            }
        }
    }

    /// Number of entries currently resident in the cache.
    pub fn len(&self) -> usize {
        self.shared.slots.lock().entries.len()
    }

    /// True if the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every entry, close the eviction pipe, and wait for the
    /// worker to drain it. The cache must not be used after this
    /// returns (spec §4.B).
    pub fn flush(&self) {
        self.evict(1.0);
        if let Some(tx) = self.evict_tx.lock().take() {
            drop(tx);
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn insert(&self, key: K, value: V) {
        let mut slots = self.shared.slots.lock();
        slots.tick += 1;
        let tick = slots.tick;
        slots.entries.insert(key, Slot { value, freq: 1, last_used: tick });
    }
}

fn eviction_worker<K, V>(shared: Arc<Shared<K, V>>, rx: Receiver<(K, V)>)
where
    K: Eq + Hash + Clone + AsRef<[u8]>,
{
    while let Ok((key, value)) = rx.recv() {
        match shared.save_to_backend(&key, &value) {
            Ok(()) => {
                shared
                    .recorder
                    .count(&format!("storage_{}_write", shared.name), 1);
            }
            Err(e) => {
                warn!(store = %shared.name, error = %e, "eviction write-through failed, requeuing entry");
                shared
                    .recorder
                    .count(&format!("storage_{}_write_err", shared.name), 1);
                let mut slots = shared.slots.lock();
                slots.tick += 1;
                let tick = slots.tick;
                slots.entries.entry(key).or_insert(Slot {
                    value,
                    freq: 1,
                    last_used: tick,
                });
            }
        }
    }
}
