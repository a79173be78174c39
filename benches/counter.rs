//! The striped counter itself is crate-private, so these benches exercise
//! it indirectly through `len()`/`store()` under the access pattern that
//! actually stresses it: many threads racing to bump the same logical
//! count (store_if_absent on a shared key contends on the counter's base
//! cell the same way distinct-key inserts would, without the added cost of
//! distinct bin locks).

use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use striped_map::StripedMap;

fn bench_contended_single_key_store_if_absent(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_if_absent_contended_key");
    for threads in [1usize, 2, 4, 8, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let map = Arc::new(StripedMap::<u64, u64>::new());
                thread::scope(|scope| {
                    for t in 0..threads as u64 {
                        let map = Arc::clone(&map);
                        scope.spawn(move || {
                            for _ in 0..1_000 {
                                map.store_if_absent(0, t);
                            }
                        });
                    }
                });
                map
            });
        });
    }
    group.finish();
}

fn bench_len_under_concurrent_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("len_while_writing");
    group.bench_function("8_writers", |b| {
        b.iter(|| {
            let map = Arc::new(StripedMap::<u64, u64>::new());
            thread::scope(|scope| {
                for t in 0..8u64 {
                    let map = Arc::clone(&map);
                    scope.spawn(move || {
                        for i in 0..2_000u64 {
                            map.store(t * 2_000 + i, i);
                        }
                    });
                }
                for _ in 0..100 {
                    let _ = map.len();
                }
            });
            map
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_contended_single_key_store_if_absent,
    bench_len_under_concurrent_writes
);
criterion_main!(benches);
