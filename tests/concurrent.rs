//! Multi-threaded correctness: interleaved store/store_if_absent/load from
//! many threads against a shared map, checked against the actual per-key
//! invariant rather than a fragile exact-ordering assumption.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use striped_map::StripedMap;

#[test]
fn store_if_absent_is_exclusive_under_contention() {
    let map = Arc::new(StripedMap::<u64, usize>::new());
    let winners = Arc::new(AtomicUsize::new(0));
    let threads: usize = 16;

    thread::scope(|scope| {
        for t in 0..threads {
            let map = Arc::clone(&map);
            let winners = Arc::clone(&winners);
            scope.spawn(move || {
                if map.store_if_absent(42, t).is_none() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    // Exactly one thread's insert call must have found the key absent.
    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert!(map.load(&42).unwrap() < threads);
}

#[test]
fn concurrent_distinct_key_writers_dont_clobber_each_other() {
    let map = Arc::new(StripedMap::<u64, u64>::new());
    let threads: u64 = 12;
    let per_thread = 2_000u64;

    thread::scope(|scope| {
        for t in 0..threads {
            let map = Arc::clone(&map);
            scope.spawn(move || {
                for i in 0..per_thread {
                    let key = t * per_thread + i;
                    map.store(key, key);
                }
            });
        }
    });

    assert_eq!(map.len(), (threads * per_thread) as usize);
    for key in 0..(threads * per_thread) {
        assert_eq!(map.load(&key), Some(key));
    }
}

#[test]
fn concurrent_overwrites_of_shared_keys_always_see_some_writer() {
    let map = Arc::new(StripedMap::<&str, u64>::new());
    let keys = ["a", "b", "c", "d"];
    let threads = 8;

    thread::scope(|scope| {
        for t in 0..threads {
            let map = Arc::clone(&map);
            scope.spawn(move || {
                for &k in &keys {
                    map.store(k, t as u64);
                }
            });
        }
    });

    for &k in &keys {
        assert!(map.load(k).is_some());
    }
    assert_eq!(map.len(), keys.len());
}

#[test]
fn readers_never_observe_a_torn_value() {
    let map = Arc::new(StripedMap::<&str, (u64, u64)>::new());
    map.store("pair", (0, 0));

    thread::scope(|scope| {
        let writer_map = Arc::clone(&map);
        scope.spawn(move || {
            for i in 0..50_000u64 {
                writer_map.store("pair", (i, i));
            }
        });

        for _ in 0..4 {
            let reader_map = Arc::clone(&map);
            scope.spawn(move || {
                for _ in 0..10_000 {
                    let (a, b) = reader_map.load("pair").unwrap();
                    assert_eq!(a, b, "observed a torn write: ({a}, {b})");
                }
            });
        }
    });
}
