//! Single-threaded API coverage: store/load/store_if_absent, overwrite
//! semantics, absent-key lookups, and capacity construction.

use striped_map::StripedMap;

#[test]
fn store_then_load_roundtrips() {
    let map = StripedMap::new();
    assert_eq!(map.store("a", 1), None);
    assert_eq!(map.load("a"), Some(1));
    assert_eq!(map.load("missing"), None);
}

#[test]
fn store_overwrites_and_returns_previous_value() {
    let map = StripedMap::new();
    assert_eq!(map.store("a", 1), None);
    assert_eq!(map.store("a", 2), Some(1));
    assert_eq!(map.load("a"), Some(2));
}

#[test]
fn store_if_absent_keeps_existing_value() {
    let map = StripedMap::new();
    assert_eq!(map.store_if_absent("a", 1), None);
    assert_eq!(map.store_if_absent("a", 2), Some(1));
    assert_eq!(map.load("a"), Some(1));
}

#[test]
fn contains_key_matches_load() {
    let map = StripedMap::new();
    map.store("a", 1);
    assert!(map.contains_key("a"));
    assert!(!map.contains_key("b"));
}

#[test]
fn len_and_is_empty_track_distinct_keys() {
    let map = StripedMap::new();
    assert!(map.is_empty());
    map.store("a", 1);
    map.store("b", 2);
    assert_eq!(map.len(), 2);
    map.store("a", 99);
    assert_eq!(map.len(), 2);
    assert!(!map.is_empty());
}

#[test]
fn many_distinct_keys_all_survive() {
    let map = StripedMap::new();
    for i in 0..5_000i64 {
        map.store(i, i * 2);
    }
    for i in 0..5_000i64 {
        assert_eq!(map.load(&i), Some(i * 2));
    }
    assert_eq!(map.len(), 5_000);
}

#[test]
fn with_capacity_preallocates_without_panicking() {
    let map: StripedMap<i32, i32> = StripedMap::with_capacity(1_000, 16);
    assert!(map.is_empty());
}

#[test]
fn try_with_capacity_reports_overflow() {
    let err = StripedMap::<i32, i32>::try_with_capacity(usize::MAX, usize::MAX)
        .expect_err("capacity this large must overflow");
    assert!(matches!(err, striped_map::MapError::CapacityOverflow(_)));
}

#[test]
fn debug_format_lists_entries() {
    let map = StripedMap::new();
    map.store("a", 1);
    let formatted = format!("{map:?}");
    assert!(formatted.contains('a'));
    assert!(formatted.contains('1'));
}
