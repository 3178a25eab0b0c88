//! Concurrent façade access: parallel writers to distinct series don't
//! contend, while writers to the same series serialize (spec §5).

use profilestore::{Config, PutInput, SeriesKey, Storage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn config(path: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.storage_path = path.to_path_buf();
    cfg.eviction_interval = std::time::Duration::from_secs(3600);
    cfg
}

fn stack(samples: u64) -> (Vec<String>, u64) {
    (vec!["a".to_string()], samples)
}

#[test]
fn parallel_puts_to_distinct_series_all_land() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(Storage::open(&config(dir.path())).unwrap());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let storage = storage.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let key = SeriesKey::parse(&format!("svc{i}")).unwrap();
                barrier.wait();
                for t in 0..5 {
                    storage
                        .put(PutInput {
                            key: &key,
                            start_time: t * 10,
                            end_time: t * 10 + 10,
                            stacks: &[stack(1)],
                            spy_name: "rbspy",
                            sample_rate: 100,
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for i in 0..8 {
        let key = SeriesKey::parse(&format!("svc{i}")).unwrap();
        let out = storage
            .get(profilestore::GetInput {
                key: &key,
                start_time: 0,
                end_time: 50,
            })
            .unwrap()
            .unwrap();
        let total: u64 = out.stacks.iter().map(|(_, n)| n).sum();
        assert_eq!(total, 5, "series svc{i} must see all 5 of its own puts");
    }
}

#[test]
fn same_series_puts_serialize_and_accumulate_exactly() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(Storage::open(&config(dir.path())).unwrap());
    let key = Arc::new(SeriesKey::parse("contended").unwrap());
    let barrier = Arc::new(Barrier::new(8));
    let committed = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let storage = storage.clone();
            let key = key.clone();
            let barrier = barrier.clone();
            let committed = committed.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..20 {
                    storage
                        .put(PutInput {
                            key: &key,
                            start_time: 0,
                            end_time: 20,
                            stacks: &[stack(1)],
                            spy_name: "rbspy",
                            sample_rate: 100,
                        })
                        .unwrap();
                    committed.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let out = storage
        .get(profilestore::GetInput {
            key: &key,
            start_time: 0,
            end_time: 20,
        })
        .unwrap()
        .unwrap();
    let total: u64 = out.stacks.iter().map(|(_, n)| n).sum();
    assert_eq!(total, committed.load(Ordering::Relaxed), "no put may be lost under contention");
    assert_eq!(total, 160);
}
