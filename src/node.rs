//! Bin entries: regular chain nodes and forwarding markers.
//!
//! A bin head is one of three kinds, distinguished here by an enum variant
//! rather than by the sign of a packed hash field (see DESIGN.md's note on
//! "Union-of-node-kinds by sign bit"):
//!
//! - [`BinNode::Regular`]: the head of a singly linked chain of entries
//!   that hash into this bin.
//! - [`BinNode::Forwarding`]: this bin has been migrated; lookups must
//!   re-index into the successor table.
//! - [`BinNode::Reserved`]: named for parity with the source's tag space
//!   (`TREEBIN`/`RESERVED`); never constructed, since this crate omits tree
//!   bins and transient reservations entirely.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::hash::{bin_index, spread};
use crate::table::TableRef;

pub(crate) enum BinNode<K, V> {
    Regular(RegularNode<K, V>),
    Forwarding(TableRef<K, V>),
    #[allow(dead_code)]
    Reserved,
}

pub(crate) struct RegularNode<K, V> {
    pub(crate) hash: i32,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BinNode<K, V>>,
}

impl<K, V> RegularNode<K, V> {
    pub(crate) fn new(hash: i32, key: K, value: V) -> Self {
        Self {
            hash,
            key,
            value: Atomic::new(value),
            next: Atomic::null(),
        }
    }
}

impl<K, V> BinNode<K, V> {
    #[inline]
    pub(crate) fn is_forwarding(&self) -> bool {
        matches!(self, BinNode::Forwarding(_))
    }
}

/// Looks up `key` starting from `table`, chasing forwarding markers
/// iteratively (never recursively) across however many resize generations
/// are currently in flight (spec.md §4.5.5).
pub(crate) fn find<K, V, Q>(
    mut table: TableRef<K, V>,
    hash: i32,
    key: &Q,
    guard: &Guard,
) -> Option<V>
where
    K: Hash + Eq + Borrow<Q>,
    Q: Hash + Eq + ?Sized,
    V: Clone,
{
    loop {
        let n = table.len();
        let bin = table.at(bin_index(hash, n));
        let mut node = bin.head.load(Ordering::Acquire, guard);
        loop {
            let node_ref = match unsafe { node.as_ref() } {
                None => return None,
                Some(n) => n,
            };
            match node_ref {
                BinNode::Regular(entry) => {
                    if entry.hash == hash && entry.key.borrow() == key {
                        let v = entry.value.load(Ordering::Acquire, guard);
                        return unsafe { v.as_ref() }.cloned();
                    }
                    node = entry.next.load(Ordering::Acquire, guard);
                }
                BinNode::Forwarding(next_table) => {
                    table = next_table.clone();
                    break;
                }
                BinNode::Reserved => return None,
            }
        }
    }
}

/// Existence check mirroring [`find`], without requiring `V: Clone`.
pub(crate) fn contains<K, V, Q>(mut table: TableRef<K, V>, hash: i32, key: &Q, guard: &Guard) -> bool
where
    K: Hash + Eq + Borrow<Q>,
    Q: Hash + Eq + ?Sized,
{
    loop {
        let n = table.len();
        let bin = table.at(bin_index(hash, n));
        let mut node = bin.head.load(Ordering::Acquire, guard);
        loop {
            let node_ref = match unsafe { node.as_ref() } {
                None => return false,
                Some(n) => n,
            };
            match node_ref {
                BinNode::Regular(entry) => {
                    if entry.hash == hash && entry.key.borrow() == key {
                        return true;
                    }
                    node = entry.next.load(Ordering::Acquire, guard);
                }
                BinNode::Forwarding(next_table) => {
                    table = next_table.clone();
                    break;
                }
                BinNode::Reserved => return false,
            }
        }
    }
}

/// Rehashes `key` with the given hasher-derived raw hash into the spread
/// form stored on every [`RegularNode`].
#[inline]
pub(crate) fn spread_hash_for<K: Hash + ?Sized>(
    key: &K,
    hash_builder: &impl std::hash::BuildHasher,
) -> i32 {
    spread(crate::hash::fingerprint(key, hash_builder))
}

#[allow(dead_code)]
pub(crate) fn owned_regular<K, V>(hash: i32, key: K, value: V) -> Owned<BinNode<K, V>> {
    Owned::new(BinNode::Regular(RegularNode::new(hash, key, value)))
}

#[allow(dead_code)]
pub(crate) fn forwarding_owned<K, V>(next_table: TableRef<K, V>) -> Owned<BinNode<K, V>> {
    Owned::new(BinNode::Forwarding(next_table))
}

pub(crate) type NodeShared<'g, K, V> = Shared<'g, BinNode<K, V>>;
