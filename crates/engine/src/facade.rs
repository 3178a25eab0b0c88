//! Storage façade (spec §4.G): the top-level `Put`/`Get`/`Delete`/
//! `GetValues`/`Close` surface that orchestrates the dictionary (C),
//! tree store (D), segment store (E), and dimension index (F) behind a
//! per-series locking discipline (spec §5).

use std::sync::Arc;

use tracing::{debug, info, warn};

use profilestore_core::key::NAME_LABEL;
use profilestore_core::{round_range_to_grid, Config, Error, NoopRecorder, Recorder, Result, SeriesKey};
use profilestore_concurrency::{EvictionScheduler, SeriesLockManager};
use profilestore_storage::Backend;

use crate::dictionary::Dictionary;
use crate::dimension::DimensionIndex;
use crate::segment::SegmentStore;
use crate::tree::{tree_key, Tree, TreeStore};

/// One (frame-path, sample-count) pair from a caller-supplied profile.
/// The façade interns each frame through the dictionary before merging
/// it into the tree store (spec §4.G step 2).
pub type Stack = (Vec<String>, u64);

/// Arguments to [`Storage::put`].
pub struct PutInput<'a> {
    /// The series this profile belongs to.
    pub key: &'a SeriesKey,
    /// Start of the covered interval, in whole seconds since the epoch.
    pub start_time: u64,
    /// End of the covered interval (exclusive), in whole seconds.
    pub end_time: u64,
    /// Flattened stacks contributing to this interval.
    pub stacks: &'a [Stack],
    /// Profiler/spy identifier (spec §6 `Put`); accepted for interface
    /// parity but not persisted by the storage core itself.
    pub spy_name: &'a str,
    /// Sample rate, recorded on first segment creation.
    pub sample_rate: u32,
}

/// Arguments to [`Storage::get`].
pub struct GetInput<'a> {
    /// The series to query.
    pub key: &'a SeriesKey,
    /// Start of the queried interval, in whole seconds since the epoch.
    pub start_time: u64,
    /// End of the queried interval (exclusive), in whole seconds.
    pub end_time: u64,
}

/// Arguments to [`Storage::delete`].
pub struct DeleteInput<'a> {
    /// The series to delete from.
    pub key: &'a SeriesKey,
    /// Start of the interval to delete, in whole seconds since the epoch.
    pub start_time: u64,
    /// End of the interval to delete (exclusive), in whole seconds.
    pub end_time: u64,
}

/// One covering bucket returned by [`Storage::get`], after overlap
/// scaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineSample {
    /// Bucket start, in whole seconds since the epoch.
    pub t_start: u64,
    /// Bucket duration in seconds.
    pub duration: u64,
    /// Samples attributed to this bucket within the query range.
    pub samples: u64,
}

/// Result of [`Storage::get`]: the merged, string-domain call tree and
/// the per-bucket timeline it was assembled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOutput {
    /// Flattened `(frame path, self samples)` pairs, translated back to
    /// strings via the dictionary.
    pub stacks: Vec<Stack>,
    /// The covering buckets the tree was merged from.
    pub timeline: Vec<TimelineSample>,
}

/// The top-level storage instance (spec §4.G). Safe for concurrent use
/// by multiple callers; holds no process-wide state (spec §5).
pub struct Storage {
    backend: Arc<Backend>,
    dictionary: Dictionary,
    trees: Arc<TreeStore>,
    segments: Arc<SegmentStore>,
    dimensions: DimensionIndex,
    series_locks: SeriesLockManager,
    max_nodes_serialization: usize,
    scheduler: Option<EvictionScheduler>,
}

impl Storage {
    /// Open a storage instance rooted at `config.storage_path`, starting
    /// the periodic eviction task (spec §4.G "Startup").
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with_recorder(config, Arc::new(NoopRecorder))
    }

    /// Open with an injected [`Recorder`] shared by every component.
    pub fn open_with_recorder(config: &Config, recorder: Arc<dyn Recorder>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::InvalidKey(e.to_string()))?;

        let backend = Arc::new(Backend::open(&config.storage_path)?);
        let dictionary = Dictionary::open_with_recorder(backend.clone(), recorder.clone())?;
        let trees = Arc::new(TreeStore::open_with_recorder(backend.clone(), recorder.clone()));
        let segments = Arc::new(SegmentStore::open_with_recorder(backend.clone(), recorder.clone()));
        let dimensions = DimensionIndex::open_with_recorder(backend.clone(), recorder);
        let series_locks = SeriesLockManager::new();

        let fraction = config.eviction_fraction;
        // Byte-budget sampling against cache_*_size is not implemented
        // (the cache layer tracks entry counts, not serialized byte
        // size); this ticks unconditionally every interval instead,
        // matching the conservative "evict fraction every interval"
        // reading of spec §4.G.
        let evict_segments = segments.clone();
        let evict_trees = trees.clone();
        let scheduler = EvictionScheduler::start(config.eviction_interval, move || {
            debug!(target: "profilestore::facade", fraction, "periodic eviction tick");
            evict_segments.evict(fraction);
            evict_trees.evict(fraction);
        });

        info!(
            target: "profilestore::facade",
            path = %config.storage_path.display(),
            "storage opened"
        );

        Ok(Storage {
            backend,
            dictionary,
            trees,
            segments,
            dimensions,
            series_locks,
            max_nodes_serialization: config.max_nodes_serialization,
            scheduler: Some(scheduler),
        })
    }

    /// Ingest `input`'s stacks into the series' segment and tree stores
    /// for `[start_time, end_time)` (spec §4.G `Put`).
    pub fn put(&self, input: PutInput) -> Result<()> {
        let segkey = input.key.canonical();

        for (name, value) in input.key.labels() {
            self.dimensions.insert(name, value, &segkey)?;
        }
        self.dimensions.insert(NAME_LABEL, input.key.app(), &segkey)?;

        let mut tree = Tree::new();
        for (path, samples) in input.stacks {
            let mut ids = Vec::with_capacity(path.len());
            for frame in path {
                ids.push(self.dictionary.put(frame)?);
            }
            tree.insert_stack(&ids, *samples);
        }
        tree.prune_to_max_nodes(self.max_nodes_serialization);

        let total_samples: u64 = input.stacks.iter().map(|(_, n)| *n).sum();
        // Bucket decomposition assumes an aligned, exactly-tiling span
        // (spec §4.G: "the façade rounds half-open to the grid"); widen
        // the requested range outward before it reaches the segment
        // tree, and weight by this same widened span so per-bucket
        // fractions sum to the whole.
        let (t0, t1) = round_range_to_grid(input.start_time, input.end_time);
        let total_duration = t1 - t0;

        self.series_locks.with_series_lock(&segkey, || -> Result<()> {
            // The segment header's `units`/`aggregation_type` fields are
            // not among `PutInput`'s spec'd fields; `spy_name` is
            // accepted (per §6's `Put` signature) but has no home in
            // the segment format, so it passes through unused here.
            let mut segment =
                self.segments
                    .get_or_create(&segkey, input.sample_rate, "samples", "sum")?;
            let _ = input.spy_name;

            let mut merge_err = None;
            segment.put(t0, t1, total_samples, |level, t_start, duration| {
                if merge_err.is_some() {
                    return;
                }
                let result = (|| -> Result<()> {
                    let tkey = tree_key(&segkey, level, t_start);
                    let existing = self.trees.get(&tkey)?;
                    let slice = tree.scale(duration, total_duration);
                    self.trees.put(tkey, existing.merge(&slice))
                })();
                if let Err(e) = result {
                    merge_err = Some(e);
                }
            });

            self.segments.put(segkey.clone(), segment)?;
            match merge_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    /// Return the merged tree and timeline covering `[start_time,
    /// end_time)`, or `None` if the series has no data there (spec §4.G
    /// `Get`).
    pub fn get(&self, input: GetInput) -> Result<Option<GetOutput>> {
        let segkey = input.key.canonical();
        let mut covering: Vec<(u8, u64, u64, u64)> = Vec::new();
        let mut fetch_err = None;

        self.series_locks.with_series_lock(&segkey, || {
            match self.segments.get(&segkey) {
                Ok(Some(segment)) => {
                    segment.get(input.start_time, input.end_time, |level, t_start, duration, samples, _writes| {
                        covering.push((level, t_start, duration, samples));
                    });
                }
                Ok(None) => {}
                Err(e) => fetch_err = Some(e),
            }
        });
        if let Some(e) = fetch_err {
            return Err(e);
        }

        if covering.is_empty() {
            return Ok(None);
        }

        let mut merged = Tree::new();
        let mut timeline = Vec::with_capacity(covering.len());
        for (level, t_start, duration, samples_in_range) in &covering {
            let tkey = tree_key(&segkey, *level, *t_start);
            let node_tree = self.trees.get(&tkey)?;

            let node_end = t_start + duration;
            let overlap_start = (*t_start).max(input.start_time);
            let overlap_end = node_end.min(input.end_time);
            let overlap = overlap_end.saturating_sub(overlap_start);

            let scaled = if overlap == *duration {
                node_tree
            } else {
                node_tree.scale(overlap, *duration)
            };
            merged = merged.merge(&scaled);
            timeline.push(TimelineSample {
                t_start: *t_start,
                duration: *duration,
                samples: *samples_in_range,
            });
        }

        let mut stacks = Vec::new();
        let mut translate_err = None;
        merged.iterate(|path, self_samples| {
            if self_samples == 0 || translate_err.is_some() {
                return;
            }
            let mut frames = Vec::with_capacity(path.len());
            for &id in path {
                match self.dictionary.get(id) {
                    Ok(Some(s)) => frames.push(s),
                    Ok(None) => {
                        translate_err = Some(Error::CorruptEntry(format!(
                            "dictionary missing id {id}"
                        )));
                        return;
                    }
                    Err(e) => {
                        translate_err = Some(e);
                        return;
                    }
                }
            }
            stacks.push((frames, self_samples));
        });
        if let Some(e) = translate_err {
            return Err(e);
        }

        Ok(Some(GetOutput { stacks, timeline }))
    }

    /// Delete the series' segment, tree, and (when the series becomes
    /// empty) dimension entries for `[start_time, end_time)` (spec §4.G
    /// `Delete`). Dictionary entries are never removed.
    pub fn delete(&self, input: DeleteInput) -> Result<()> {
        let segkey = input.key.canonical();
        let mut delete_err = None;
        let mut now_empty = false;
        // Same outward rounding as `put`, so a `Delete` covering the
        // same nominal range always removes exactly what was written.
        let (t0, t1) = round_range_to_grid(input.start_time, input.end_time);

        self.series_locks.with_series_lock(&segkey, || {
            let mut segment = match self.segments.get(&segkey) {
                Ok(Some(s)) => s,
                Ok(None) => return,
                Err(e) => {
                    delete_err = Some(e);
                    return;
                }
            };

            segment.delete(t0, t1, |level, t_start, _duration| {
                if delete_err.is_some() {
                    return;
                }
                if let Err(e) = self.trees.delete(&tree_key(&segkey, level, t_start)) {
                    delete_err = Some(e);
                }
            });

            now_empty = segment.is_empty();
            let result = if now_empty {
                self.segments.delete(&segkey)
            } else {
                self.segments.put(segkey.clone(), segment)
            };
            if let Err(e) = result {
                delete_err = Some(e);
            }
        });

        if let Some(e) = delete_err {
            return Err(e);
        }

        if now_empty {
            for (name, value) in input.key.labels() {
                self.dimensions.delete(name, value, &segkey)?;
            }
            self.dimensions.delete(NAME_LABEL, input.key.app(), &segkey)?;
        }
        Ok(())
    }

    /// Visit every distinct value ever recorded for `label_name`, in
    /// sorted order, until `visit` returns `false` (spec §4.G
    /// `GetValues`).
    pub fn get_values(&self, label_name: &str, mut visit: impl FnMut(&str) -> bool) -> Result<()> {
        for value in self.dimensions.values(label_name)? {
            if !visit(&value) {
                break;
            }
        }
        Ok(())
    }

    /// Stop the periodic eviction task, flush every store in F, E, D, C
    /// order, and close the backend (spec §4.G "Shutdown").
    pub fn close(mut self) -> Result<()> {
        self.scheduler.take();

        self.dimensions.flush();
        self.segments.flush();
        self.trees.flush();
        self.dictionary.flush();

        match Arc::try_unwrap(self.backend) {
            Ok(backend) => {
                let result = backend.close();
                match &result {
                    Ok(()) => info!(target: "profilestore::facade", "storage closed"),
                    Err(e) => warn!(target: "profilestore::facade", error = %e, "error closing backend"),
                }
                result
            }
            Err(_) => {
                warn!(
                    target: "profilestore::facade",
                    "backend still referenced at close; dangling Arc handle"
                );
                Err(Error::Closed)
            }
        }
    }

}
