//! Segment tree (spec §4.E): a sparse power-of-two bucket index for one
//! series' time axis. Purely structural: it knows nothing about the
//! tree store; callers supply a visitor invoked per touched bucket so
//! the façade can drive call-tree merges (spec §9, "callback-driven
//! Put/Get").

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use std::io::Cursor;
use std::sync::Arc;

use profilestore_core::{bucket_duration, round_half_even, Error, NoopRecorder, Recorder, Result, MAX_LEVEL};
use profilestore_storage::varint::{read_uvarint, write_uvarint};
use profilestore_storage::{Backend, Cache, CacheConfig};

const SEGMENT_MAGIC: u32 = 0x5053_4754; // "PSGT"
const SEGMENT_FORMAT_VERSION: u8 = 1;
const SEGMENT_STORE_PREFIX: &[u8] = b"s:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegNode {
    samples: u64,
    writes: u64,
}

/// Decompose `[t0, t1)` into the minimal set of grid-aligned power-of-two
/// buckets that cover it, greedily choosing the largest bucket that fits
/// at each step (spec §4.E). Returns `(level, t_start, duration)` in
/// left-to-right chronological order.
///
/// Assumes `t0` is already aligned to the level-0 grid (10s): the
/// façade rounds half-open ranges to the grid before calling into the
/// segment tree. An unaligned `t0` decomposes into a single bucket that
/// may overshoot `t1`.
fn decompose(t0: u64, t1: u64) -> Vec<(u8, u64, u64)> {
    debug_assert!(t0 % bucket_duration(0) == 0, "decompose requires a grid-aligned t0");
    debug_assert!(t1 > t0, "decompose requires a non-empty range");
    let mut buckets = Vec::new();
    let mut cursor = t0;
    while cursor < t1 {
        let mut chosen_level = 0u8;
        let mut chosen_duration = bucket_duration(0);
        for level in 0..=MAX_LEVEL {
            let duration = bucket_duration(level);
            if cursor % duration == 0 && cursor + duration <= t1 {
                chosen_level = level;
                chosen_duration = duration;
            } else if cursor % duration != 0 {
                // Coarser levels won't align either once this one fails.
                break;
            }
        }
        buckets.push((chosen_level, cursor, chosen_duration));
        cursor += chosen_duration;
    }
    buckets
}

/// One series' sparse segment index: the set of populated `(level,
/// t_start)` nodes, addressed by derived key rather than pointers (spec
/// §9).
#[derive(Debug, Clone)]
pub struct Segment {
    sample_rate: u32,
    units: String,
    aggregation_type: String,
    nodes: FxHashMap<(u8, u64), SegNode>,
}

impl Segment {
    /// A fresh, empty segment with the given header metadata.
    pub fn new(sample_rate: u32, units: impl Into<String>, aggregation_type: impl Into<String>) -> Self {
        Segment {
            sample_rate,
            units: units.into(),
            aggregation_type: aggregation_type.into(),
            nodes: FxHashMap::default(),
        }
    }

    /// Sample rate recorded at segment creation.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// `true` once every node has been removed (spec §4.E: "a segment
    /// with no live nodes is itself removed").
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Decompose `[t0, t1)`, update each chosen bucket's `samples` and
    /// `writes` counters (apportioning `sample_count` by duration share),
    /// propagate the sample delta up through every ancestor level so
    /// (S1) additivity holds, and invoke `cb(level, t_start, duration)`
    /// per bucket so the caller can merge the matching tree-store slice.
    pub fn put(&mut self, t0: u64, t1: u64, sample_count: u64, mut cb: impl FnMut(u8, u64, u64)) {
        let total_duration = t1 - t0;
        for (level, t_start, duration) in decompose(t0, t1) {
            let delta = round_half_even(sample_count, duration, total_duration);
            let entry = self.nodes.entry((level, t_start)).or_insert(SegNode { samples: 0, writes: 0 });
            entry.samples += delta;
            entry.writes += 1;
            self.propagate_up(level, t_start, delta);
            cb(level, t_start, duration);
        }
    }

    /// Decompose `[t0, t1)` identically to [`Segment::put`], remove each
    /// chosen node (if present), decrement ancestor `samples` by what is
    /// removed, and invoke `cb(level, t_start, duration)` so the caller
    /// can drop the matching tree-store entry. Idempotent: buckets with
    /// no node are still visited via `cb`.
    pub fn delete(&mut self, t0: u64, t1: u64, mut cb: impl FnMut(u8, u64, u64)) {
        for (level, t_start, duration) in decompose(t0, t1) {
            if let Some(removed) = self.nodes.remove(&(level, t_start)) {
                self.propagate_down_removal(level, t_start, removed.samples);
            }
            cb(level, t_start, duration);
        }
    }

    /// Minimal covering set of existing nodes for `[t0, t1)`: descend
    /// from the highest occupied level, emitting a node once it is
    /// either wholly contained in the range or childless (spec §4.E).
    /// `visit` receives `(level, t_start, duration, samples_in_range,
    /// writes)`, with `samples_in_range` scaled by banker's rounding on
    /// partial overlap.
    pub fn get(&self, t0: u64, t1: u64, mut visit: impl FnMut(u8, u64, u64, u64, u64)) {
        let top_duration = bucket_duration(MAX_LEVEL);
        let mut t_start = (t0 / top_duration) * top_duration;
        while t_start < t1 {
            if self.nodes.contains_key(&(MAX_LEVEL, t_start)) {
                self.collect_covering(MAX_LEVEL, t_start, t0, t1, &mut visit);
            }
            t_start += top_duration;
        }
    }

    fn collect_covering(
        &self,
        level: u8,
        t_start: u64,
        t0: u64,
        t1: u64,
        visit: &mut impl FnMut(u8, u64, u64, u64, u64),
    ) {
        let duration = bucket_duration(level);
        let t_end = t_start + duration;
        if t_end <= t0 || t_start >= t1 {
            return;
        }
        let node = match self.nodes.get(&(level, t_start)) {
            Some(n) => *n,
            None => return,
        };
        let fully_contained = t_start >= t0 && t_end <= t1;
        let has_children = level > 0
            && (self.nodes.contains_key(&(level - 1, t_start))
                || self.nodes.contains_key(&(level - 1, t_start + duration / 2)));

        if fully_contained || !has_children {
            let overlap_start = t_start.max(t0);
            let overlap_end = t_end.min(t1);
            let overlap = overlap_end - overlap_start;
            let samples_in_range = if overlap == duration {
                node.samples
            } else {
                round_half_even(node.samples, overlap, duration)
            };
            visit(level, t_start, duration, samples_in_range, node.writes);
            return;
        }

        let half = duration / 2;
        self.collect_covering(level - 1, t_start, t0, t1, visit);
        self.collect_covering(level - 1, t_start + half, t0, t1, visit);
    }

    fn propagate_up(&mut self, level: u8, t_start: u64, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut cur_level = level;
        let mut cur_start = t_start;
        while cur_level < MAX_LEVEL {
            cur_level += 1;
            let parent_duration = bucket_duration(cur_level);
            cur_start -= cur_start % parent_duration;
            let entry = self
                .nodes
                .entry((cur_level, cur_start))
                .or_insert(SegNode { samples: 0, writes: 0 });
            entry.samples += delta;
        }
    }

    fn propagate_down_removal(&mut self, level: u8, t_start: u64, removed_samples: u64) {
        if removed_samples == 0 {
            return;
        }
        let mut cur_level = level;
        let mut cur_start = t_start;
        while cur_level < MAX_LEVEL {
            cur_level += 1;
            let parent_duration = bucket_duration(cur_level);
            cur_start -= cur_start % parent_duration;
            let key = (cur_level, cur_start);
            let Some(entry) = self.nodes.get_mut(&key) else {
                continue;
            };
            entry.samples = entry.samples.saturating_sub(removed_samples);
            // propagate_up never touches a purely-ancestor node's `writes`,
            // so samples == 0 && writes == 0 means nothing was ever put
            // directly at this bucket either: it's dead weight, drop it so
            // an emptied segment actually reports empty.
            if entry.samples == 0 && entry.writes == 0 {
                self.nodes.remove(&key);
            }
        }
    }

    /// Serialize the header and a canonical `(level, t_start)`-ordered
    /// walk of populated nodes (spec §3, "Segment file").
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(SEGMENT_MAGIC).unwrap();
        buf.push(SEGMENT_FORMAT_VERSION);
        buf.write_u32::<BigEndian>(self.sample_rate).unwrap();
        write_string(&mut buf, &self.units);
        write_string(&mut buf, &self.aggregation_type);

        let mut entries: Vec<(&(u8, u64), &SegNode)> = self.nodes.iter().collect();
        entries.sort_by_key(|(k, _)| **k);
        write_uvarint(&mut buf, entries.len() as u64);
        for ((level, t_start), node) in entries {
            let duration = bucket_duration(*level);
            let half = duration / 2;
            let has_left = *level > 0 && self.nodes.contains_key(&(level - 1, *t_start));
            let has_right = *level > 0 && self.nodes.contains_key(&(level - 1, t_start + half));
            buf.push(*level);
            write_uvarint(&mut buf, *t_start);
            write_uvarint(&mut buf, node.samples);
            write_uvarint(&mut buf, node.writes);
            let bits = (has_left as u8) | ((has_right as u8) << 1);
            buf.push(bits);
        }
        buf
    }

    /// Parse the format written by [`Segment::serialize`]. Existence
    /// bits are read but not enforced: the node set itself is the
    /// source of truth for child presence.
    pub fn deserialize(bytes: &[u8]) -> Result<Segment> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| Error::CorruptEntry("truncated segment header".to_string()))?;
        if magic != SEGMENT_MAGIC {
            return Err(Error::CorruptEntry("bad segment magic".to_string()));
        }
        let version = cursor
            .read_u8()
            .map_err(|_| Error::CorruptEntry("truncated segment version".to_string()))?;
        if version != SEGMENT_FORMAT_VERSION {
            return Err(Error::CorruptEntry(format!(
                "unsupported segment format version {version}"
            )));
        }
        let sample_rate = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| Error::CorruptEntry("truncated sample rate".to_string()))?;

        let pos = cursor.position() as usize;
        let mut pos = pos;
        let units = read_string(bytes, &mut pos)?;
        let aggregation_type = read_string(bytes, &mut pos)?;

        let node_count = read_uvarint(bytes, &mut pos)?;
        let mut nodes = FxHashMap::with_capacity_and_hasher(node_count as usize, Default::default());
        for _ in 0..node_count {
            let level = *bytes
                .get(pos)
                .ok_or_else(|| Error::CorruptEntry("truncated segment node level".to_string()))?;
            pos += 1;
            let t_start = read_uvarint(bytes, &mut pos)?;
            let samples = read_uvarint(bytes, &mut pos)?;
            let writes = read_uvarint(bytes, &mut pos)?;
            let _bits = *bytes
                .get(pos)
                .ok_or_else(|| Error::CorruptEntry("truncated segment node bits".to_string()))?;
            pos += 1;
            nodes.insert((level, t_start), SegNode { samples, writes });
        }

        Ok(Segment {
            sample_rate,
            units,
            aggregation_type,
            nodes,
        })
    }
}

/// Cache-layer-backed store of one [`Segment`] per series, keyed by
/// `segkey` (spec §4.E).
pub struct SegmentStore {
    entries: Cache<String, Segment>,
}

impl SegmentStore {
    /// Open the segment store on `backend`.
    pub fn open(backend: Arc<Backend>) -> Self {
        Self::open_with_recorder(backend, Arc::new(NoopRecorder))
    }

    /// Open with an injected [`Recorder`].
    pub fn open_with_recorder(backend: Arc<Backend>, recorder: Arc<dyn Recorder>) -> Self {
        let entries = Cache::new(
            CacheConfig {
                name: "segment_store".to_string(),
                prefix: SEGMENT_STORE_PREFIX.to_vec(),
                serialize: Arc::new(|_k: &String, v: &Segment| v.serialize()),
                deserialize: Arc::new(|bytes| Segment::deserialize(bytes)),
                new_default: None,
                always_save: false,
            },
            backend,
            recorder,
        );
        SegmentStore { entries }
    }

    /// The segment at `segkey`, loading it on first reference, or a
    /// fresh one seeded with the given header metadata if none exists
    /// yet.
    pub fn get_or_create(
        &self,
        segkey: &str,
        sample_rate: u32,
        units: &str,
        aggregation_type: &str,
    ) -> Result<Segment> {
        match self.entries.get(&segkey.to_string()) {
            Ok(segment) => Ok(segment),
            Err(Error::Missing(_)) => Ok(Segment::new(sample_rate, units, aggregation_type)),
            Err(e) => Err(e),
        }
    }

    /// The segment at `segkey`, or `None` if it has never been written.
    pub fn get(&self, segkey: &str) -> Result<Option<Segment>> {
        match self.entries.get(&segkey.to_string()) {
            Ok(segment) => Ok(Some(segment)),
            Err(Error::Missing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the segment at `segkey`.
    pub fn put(&self, segkey: String, segment: Segment) -> Result<()> {
        self.entries.put(segkey, segment)
    }

    /// Remove the segment at `segkey`. Absent is a no-op.
    pub fn delete(&self, segkey: &str) -> Result<()> {
        self.entries.delete(&segkey.to_string())
    }

    /// Flush the underlying cache.
    pub fn flush(&self) {
        self.entries.flush();
    }

    /// Evict `fraction` of the least-frequently-used entries (spec
    /// §4.G: periodic eviction task).
    pub fn evict(&self, fraction: f64) {
        self.entries.evict(fraction);
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_uvarint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_uvarint(buf, pos)? as usize;
    let end = *pos + len;
    let slice = buf
        .get(*pos..end)
        .ok_or_else(|| Error::CorruptEntry("truncated segment string".to_string()))?;
    let s = String::from_utf8(slice.to_vec())
        .map_err(|_| Error::CorruptEntry("segment string is not utf-8".to_string()))?;
    *pos = end;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decomposition_matches_scenario_6() {
        let buckets = decompose(0, 30);
        let shapes: Vec<(u8, u64, u64)> = buckets;
        assert_eq!(shapes, vec![(1, 0, 20), (0, 20, 10)]);
    }

    #[test]
    fn put_records_samples_in_chosen_buckets() {
        let mut seg = Segment::new(100, "samples", "cpu");
        let mut buckets = Vec::new();
        seg.put(0, 30, 90, |level, t_start, duration| {
            buckets.push((level, t_start, duration));
        });
        assert_eq!(buckets, vec![(1, 0, 20), (0, 20, 10)]);
    }

    #[test]
    fn get_returns_absent_for_unwritten_series() {
        let seg = Segment::new(100, "samples", "cpu");
        let mut hits = 0;
        seg.get(0, 30, |_, _, _, _, _| hits += 1);
        assert_eq!(hits, 0);
    }

    #[test]
    fn get_scales_samples_on_partial_overlap() {
        // Scenario 5: Put(foo, [0,20), {a:100}); Get(foo, [10,20)) -> 50.
        let mut seg = Segment::new(100, "samples", "cpu");
        seg.put(0, 20, 100, |_, _, _| {});
        let mut found = Vec::new();
        seg.get(10, 20, |level, t_start, _duration, samples, _writes| {
            found.push((level, t_start, samples));
        });
        assert_eq!(found, vec![(1, 0, 50)]);
    }

    #[test]
    fn get_full_range_returns_exact_samples() {
        let mut seg = Segment::new(100, "samples", "cpu");
        seg.put(10, 20, 42, |_, _, _| {});
        let mut total = 0u64;
        seg.get(0, 30, |_, _, _, samples, _| total += samples);
        assert_eq!(total, 42);
    }

    #[test]
    fn delete_empties_the_segment() {
        let mut seg = Segment::new(100, "samples", "cpu");
        seg.put(0, 20, 100, |_, _, _| {});
        assert!(!seg.is_empty());
        seg.delete(0, 20, |_, _, _| {});
        assert!(seg.is_empty());
        let mut hits = 0;
        seg.get(0, 30, |_, _, _, _, _| hits += 1);
        assert_eq!(hits, 0);
    }

    #[test]
    fn round_trip_preserves_samples() {
        let mut seg = Segment::new(100, "samples", "cpu");
        seg.put(0, 30, 90, |_, _, _| {});
        let bytes = seg.serialize();
        let back = Segment::deserialize(&bytes).unwrap();
        let mut total = 0u64;
        back.get(0, 30, |_, _, _, samples, _| total += samples);
        assert_eq!(total, 90);
    }

    #[test]
    fn bad_magic_is_corrupt_entry() {
        let seg = Segment::new(100, "samples", "cpu");
        let mut bytes = seg.serialize();
        bytes[0] = 0xff;
        assert!(Segment::deserialize(&bytes).is_err());
    }

    mod store {
        use super::super::*;
        use tempfile::tempdir;

        #[test]
        fn get_or_create_seeds_a_fresh_segment() {
            let dir = tempdir().unwrap();
            let backend = Arc::new(Backend::open(dir.path()).unwrap());
            let store = SegmentStore::open(backend);
            let seg = store.get_or_create("app{}", 100, "samples", "cpu").unwrap();
            assert!(seg.is_empty());
            assert_eq!(seg.sample_rate(), 100);
        }

        #[test]
        fn put_then_get_roundtrips_through_backend() {
            let dir = tempdir().unwrap();
            let backend = Arc::new(Backend::open(dir.path()).unwrap());
            let store = SegmentStore::open(backend);
            let mut seg = Segment::new(100, "samples", "cpu");
            seg.put(0, 20, 10, |_, _, _| {});
            store.put("app{}".to_string(), seg).unwrap();
            assert!(store.get("app{}").unwrap().is_some());
        }

        #[test]
        fn delete_removes_the_entry() {
            let dir = tempdir().unwrap();
            let backend = Arc::new(Backend::open(dir.path()).unwrap());
            let store = SegmentStore::open(backend);
            store.put("k".to_string(), Segment::new(100, "samples", "cpu")).unwrap();
            store.delete("k").unwrap();
            assert!(store.get("k").unwrap().is_none());
        }
    }
}
