//! The bin array itself: a fixed-length slice of per-bin heads, each
//! guarded by its own lock for the writer side and read lock-free.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Shared};
use parking_lot::Mutex;

use crate::node::BinNode;

/// One bin: an atomic head pointer plus the mutex writers take while
/// mutating (inserting into, splitting) the chain rooted at that head.
///
/// The mutex guards no data of its own — the chain lives entirely behind
/// the atomic `head` — it exists purely for mutual exclusion between
/// writers, mirroring the teacher's `BaseNode::lock`.
pub(crate) struct Bin<K, V> {
    pub(crate) lock: Mutex<()>,
    pub(crate) head: Atomic<BinNode<K, V>>,
}

impl<K, V> Bin<K, V> {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            head: Atomic::null(),
        }
    }
}

/// A table generation: a power-of-two-length array of bins.
pub(crate) struct Table<K, V> {
    bins: Box<[Bin<K, V>]>,
}

/// Tables are shared by reference count rather than epoch-reclaimed
/// directly: a [`crate::node::BinNode::Forwarding`] node holds a clone of
/// this `Arc` so that it stays valid for any reader chasing it, independent
/// of how long ago the map's `next_table` slot was cleared.
pub(crate) type TableRef<K, V> = Arc<Table<K, V>>;

impl<K, V> Table<K, V> {
    pub(crate) fn with_len(n: usize) -> TableRef<K, V> {
        debug_assert!(n.is_power_of_two());
        let mut bins = Vec::with_capacity(n);
        bins.resize_with(n, Bin::new);
        Arc::new(Self {
            bins: bins.into_boxed_slice(),
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub(crate) fn at(&self, index: usize) -> &Bin<K, V> {
        &self.bins[index]
    }
}

impl<K, V> Drop for Table<K, V> {
    /// `Atomic` does not free its pointee on drop — it is a bare tagged
    /// pointer, reclaimed only through a [`crossbeam_epoch::Guard`]. By the
    /// time a `Table`'s owning `Arc` reaches zero references nothing can be
    /// pinned against it any longer, so walking every bin under
    /// [`crossbeam_epoch::unprotected`] and reclaiming its chain directly is
    /// sound.
    fn drop(&mut self) {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        for bin in self.bins.iter() {
            let mut node = bin.head.load(Ordering::Relaxed, guard);
            while !node.is_null() {
                let owned = unsafe { node.into_owned() };
                match *owned.into_box() {
                    BinNode::Regular(entry) => {
                        let next = entry.next.load(Ordering::Relaxed, guard);
                        let v = entry.value.load(Ordering::Relaxed, guard);
                        if !v.is_null() {
                            drop(unsafe { v.into_owned() }.into_box());
                        }
                        node = next;
                    }
                    BinNode::Forwarding(_) | BinNode::Reserved => {
                        node = Shared::null();
                    }
                }
            }
        }
    }
}
