//! Black-box scenarios driving the public `profilestore` façade directly,
//! mirroring spec §8's six named scenarios.

use profilestore::{Config, DeleteInput, GetInput, PutInput, SeriesKey, Storage};
use tempfile::tempdir;

fn config(path: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.storage_path = path.to_path_buf();
    cfg.eviction_interval = std::time::Duration::from_secs(3600);
    cfg
}

fn stack(frames: &[&str], samples: u64) -> (Vec<String>, u64) {
    (frames.iter().map(|s| s.to_string()).collect(), samples)
}

fn total_samples(stacks: &[(Vec<String>, u64)]) -> u64 {
    stacks.iter().map(|(_, n)| n).sum()
}

#[test]
fn scenario_1_simple_write_read() {
    let dir = tempdir().unwrap();
    let storage = Storage::open(&config(dir.path())).unwrap();
    let key = SeriesKey::parse("foo").unwrap();

    storage
        .put(PutInput {
            key: &key,
            start_time: 10,
            end_time: 19,
            stacks: &[stack(&["a", "b"], 1), stack(&["a", "c"], 2)],
            spy_name: "rbspy",
            sample_rate: 100,
        })
        .unwrap();

    let out = storage
        .get(GetInput {
            key: &key,
            start_time: 0,
            end_time: 30,
        })
        .unwrap()
        .expect("scenario 1 must return data");
    assert_eq!(total_samples(&out.stacks), 3);
}

#[test]
fn scenario_2_delete() {
    let dir = tempdir().unwrap();
    let storage = Storage::open(&config(dir.path())).unwrap();
    let key = SeriesKey::parse("foo").unwrap();

    storage
        .put(PutInput {
            key: &key,
            start_time: 10,
            end_time: 19,
            stacks: &[stack(&["a", "b"], 1), stack(&["a", "c"], 2)],
            spy_name: "rbspy",
            sample_rate: 100,
        })
        .unwrap();
    storage
        .delete(DeleteInput {
            key: &key,
            start_time: 10,
            end_time: 19,
        })
        .unwrap();

    let out = storage
        .get(GetInput {
            key: &key,
            start_time: 0,
            end_time: 30,
        })
        .unwrap();
    assert!(out.is_none(), "scenario 2 must return absent after delete");
}

#[test]
fn scenario_3_put_after_delete() {
    let dir = tempdir().unwrap();
    let storage = Storage::open(&config(dir.path())).unwrap();
    let key = SeriesKey::parse("foo").unwrap();

    storage
        .put(PutInput {
            key: &key,
            start_time: 0,
            end_time: 20,
            stacks: &[stack(&["a", "b"], 1), stack(&["a", "c"], 2)],
            spy_name: "rbspy",
            sample_rate: 100,
        })
        .unwrap();
    storage
        .delete(DeleteInput {
            key: &key,
            start_time: 0,
            end_time: 20,
        })
        .unwrap();
    storage
        .put(PutInput {
            key: &key,
            start_time: 0,
            end_time: 20,
            stacks: &[stack(&["c", "d"], 1), stack(&["e", "f"], 2)],
            spy_name: "rbspy",
            sample_rate: 100,
        })
        .unwrap();

    let out = storage
        .get(GetInput {
            key: &key,
            start_time: 0,
            end_time: 20,
        })
        .unwrap()
        .unwrap();
    assert_eq!(total_samples(&out.stacks), 3);
    assert!(
        out.stacks.iter().all(|(path, _)| path[0] != "a"),
        "the deleted T1 stacks must not resurface"
    );
}

#[test]
fn scenario_4_persistence_across_restart() {
    let dir = tempdir().unwrap();
    let key = SeriesKey::parse("foo").unwrap();

    {
        let storage = Storage::open(&config(dir.path())).unwrap();
        storage
            .put(PutInput {
                key: &key,
                start_time: 0,
                end_time: 20,
                stacks: &[stack(&["a", "b"], 1), stack(&["a", "c"], 2)],
                spy_name: "rbspy",
                sample_rate: 100,
            })
            .unwrap();
        storage.close().unwrap();
    }

    let storage = Storage::open(&config(dir.path())).unwrap();
    let out = storage
        .get(GetInput {
            key: &key,
            start_time: 0,
            end_time: 20,
        })
        .unwrap()
        .unwrap();
    assert_eq!(total_samples(&out.stacks), 3);
}

#[test]
fn scenario_5_partial_overlap_scaling() {
    let dir = tempdir().unwrap();
    let storage = Storage::open(&config(dir.path())).unwrap();
    let key = SeriesKey::parse("foo").unwrap();

    storage
        .put(PutInput {
            key: &key,
            start_time: 0,
            end_time: 20,
            stacks: &[stack(&["a"], 100)],
            spy_name: "rbspy",
            sample_rate: 100,
        })
        .unwrap();

    let out = storage
        .get(GetInput {
            key: &key,
            start_time: 10,
            end_time: 20,
        })
        .unwrap()
        .unwrap();
    assert_eq!(total_samples(&out.stacks), 50, "ratio 0.5, banker's rounding");
}

#[test]
fn scenario_6_segment_bucket_decomposition() {
    // The façade itself doesn't expose the segment's `cb` recorder
    // directly, but the visible effect (exactly the two covering
    // buckets spec.md names) shows up as a timeline of that shape.
    let dir = tempdir().unwrap();
    let storage = Storage::open(&config(dir.path())).unwrap();
    let key = SeriesKey::parse("foo").unwrap();

    storage
        .put(PutInput {
            key: &key,
            start_time: 0,
            end_time: 30,
            stacks: &[stack(&["a"], 90)],
            spy_name: "rbspy",
            sample_rate: 100,
        })
        .unwrap();

    let out = storage
        .get(GetInput {
            key: &key,
            start_time: 0,
            end_time: 30,
        })
        .unwrap()
        .unwrap();

    let mut buckets: Vec<(u64, u64)> = out
        .timeline
        .iter()
        .map(|t| (t.t_start, t.duration))
        .collect();
    buckets.sort();
    assert_eq!(buckets, vec![(0, 20), (20, 10)]);
}
