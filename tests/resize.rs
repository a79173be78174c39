//! Forces the table through several growth generations and checks that
//! every previously-inserted key is still reachable afterward, including
//! keys inserted right as a resize is in flight.

use std::sync::Arc;
use std::thread;

use striped_map::StripedMap;

#[test]
fn single_threaded_growth_preserves_all_entries() {
    let map: StripedMap<i64, i64> = StripedMap::with_capacity(16, 1);
    let count = 20_000i64;
    for i in 0..count {
        assert_eq!(map.store(i, i), None);
    }
    assert_eq!(map.len(), count as usize);
    for i in 0..count {
        assert_eq!(map.load(&i), Some(i), "lost key {i} across growth");
    }
}

#[test]
fn concurrent_inserts_during_growth_are_all_visible() {
    let map = Arc::new(StripedMap::<i64, i64>::with_capacity(16, 1));
    let writers = 8;
    let per_writer = 5_000i64;

    thread::scope(|scope| {
        for w in 0..writers {
            let map = Arc::clone(&map);
            scope.spawn(move || {
                let base = w * per_writer;
                for i in base..(base + per_writer) {
                    map.store(i, i * 10);
                }
            });
        }
    });

    assert_eq!(map.len(), (writers * per_writer) as usize);
    for w in 0..writers {
        let base = w * per_writer;
        for i in base..(base + per_writer) {
            assert_eq!(map.load(&i), Some(i * 10));
        }
    }
}

#[test]
fn readers_see_consistent_values_while_table_grows() {
    let map = Arc::new(StripedMap::<i64, i64>::with_capacity(16, 1));
    for i in 0..1_000i64 {
        map.store(i, i);
    }

    thread::scope(|scope| {
        let writer_map = Arc::clone(&map);
        scope.spawn(move || {
            for i in 1_000..30_000i64 {
                writer_map.store(i, i);
            }
        });

        for _ in 0..4 {
            let reader_map = Arc::clone(&map);
            scope.spawn(move || {
                for i in 0..1_000i64 {
                    // Keys inserted before the writer started must never
                    // appear to vanish mid-resize.
                    assert_eq!(reader_map.load(&i), Some(i));
                }
            });
        }
    });

    assert!(map.len() >= 30_000);
}
