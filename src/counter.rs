//! Striped size counter.
//!
//! A single `base` cell absorbs increments in the uncontended case via
//! compare-and-swap. Under contention it falls back to a fixed array of
//! cache-line-padded cells, lazily allocated, selected by a cheap per-thread
//! hash. `sum()` adds `base` plus every cell; the result is advisory, not
//! linearizable (spec.md §4.3).

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU8, Ordering};
use std::thread;

use crossbeam_utils::CachePadded;
use log::trace;

/// Number of counter cells once the array is allocated. Fixed per spec.md
/// §9's adopted simplification of `fullAddCount` (no dynamic growth).
const NUM_CELLS: usize = 8;

type CellArray = Box<[CachePadded<AtomicI64>]>;

pub(crate) struct Counter {
    base: AtomicI64,
    cells: AtomicPtr<CellArray>,
    cells_busy: AtomicU8,
}

impl Counter {
    pub(crate) fn new() -> Self {
        Self {
            base: AtomicI64::new(0),
            cells: AtomicPtr::new(std::ptr::null_mut()),
            cells_busy: AtomicU8::new(0),
        }
    }

    /// Adds `x` to the logical count. Returns the post-add sum when it was
    /// cheap to compute (uncontended base CAS, or a contended cell add that
    /// the caller asked to see via `check_resize`), so callers can decide
    /// whether to drive a resize without a second `sum()` pass.
    pub(crate) fn add(&self, x: i64, check_resize: bool) -> Option<i64> {
        let b = self.base.load(Ordering::Acquire);
        if self
            .base
            .compare_exchange(b, b + x, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Some(b + x).filter(|_| check_resize);
        }
        self.add_contended(x, check_resize)
    }

    fn add_contended(&self, x: i64, check_resize: bool) -> Option<i64> {
        let h = thread_probe();
        let mut spins = 0u32;
        loop {
            let cells_ptr = self.cells.load(Ordering::Acquire);
            if !cells_ptr.is_null() {
                let cells: &CellArray = unsafe { &*cells_ptr };
                let idx = (h as usize) & (cells.len() - 1);
                cells[idx].fetch_add(x, Ordering::AcqRel);
                return if check_resize { Some(self.sum()) } else { None };
            }
            if self
                .cells_busy
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if self.cells.load(Ordering::Acquire).is_null() {
                    trace!("allocating {NUM_CELLS} counter cells after base CAS contention");
                    let mut cells: Vec<CachePadded<AtomicI64>> = Vec::with_capacity(NUM_CELLS);
                    cells.resize_with(NUM_CELLS, || CachePadded::new(AtomicI64::new(0)));
                    let cells: CellArray = cells.into_boxed_slice();
                    let idx = (h as usize) & (cells.len() - 1);
                    cells[idx].fetch_add(x, Ordering::AcqRel);
                    let boxed = Box::new(cells);
                    self.cells.store(Box::into_raw(boxed), Ordering::Release);
                }
                self.cells_busy.store(0, Ordering::Release);
                return if check_resize { Some(self.sum()) } else { None };
            }
            spins += 1;
            if spins > 64 {
                thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
            // Losing the init race repeatedly falls back to a direct base
            // add so a storm of initializers can't livelock forever.
            if spins > 1024 {
                self.base.fetch_add(x, Ordering::AcqRel);
                return if check_resize { Some(self.sum()) } else { None };
            }
        }
    }

    pub(crate) fn sum(&self) -> i64 {
        let mut sum = self.base.load(Ordering::Acquire);
        let cells_ptr = self.cells.load(Ordering::Acquire);
        if !cells_ptr.is_null() {
            let cells: &CellArray = unsafe { &*cells_ptr };
            for cell in cells.iter() {
                sum += cell.load(Ordering::Acquire);
            }
        }
        sum
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        let cells_ptr = self.cells.load(Ordering::Acquire);
        if !cells_ptr.is_null() {
            unsafe {
                drop(Box::from_raw(cells_ptr));
            }
        }
    }
}

/// Cheap, non-cryptographic per-thread probe used to pick a counter cell.
fn thread_probe() -> u64 {
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn uncontended_add_matches_sum() {
        let c = Counter::new();
        for _ in 0..100 {
            c.add(1, false);
        }
        assert_eq!(c.sum(), 100);
    }

    #[test]
    fn concurrent_adds_sum_correctly() {
        let counter = Arc::new(Counter::new());
        let threads = 8;
        let per_thread = 10_000i64;
        thread::scope(|scope| {
            for _ in 0..threads {
                let counter = Arc::clone(&counter);
                scope.spawn(move || {
                    for _ in 0..per_thread {
                        counter.add(1, false);
                    }
                });
            }
        });
        assert_eq!(counter.sum(), threads as i64 * per_thread);
    }

    #[test]
    fn negative_adds_are_reflected() {
        let c = Counter::new();
        c.add(50, false);
        c.add(-20, false);
        assert_eq!(c.sum(), 30);
    }
}
