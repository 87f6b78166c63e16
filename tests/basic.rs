use concurrent_intmap::{ConcurrentIntObjectMap, ConcurrentLongObjectMap, HashMap, IntHashing, MapConfig};

#[test]
fn empty_map() {
    let map = ConcurrentIntObjectMap::<String>::new();
    let guard = map.guard();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert!(map.get(&0, &guard).is_none());
    assert!(map.remove(&0, &guard).is_none());
    assert_eq!(map.iter(&guard).count(), 0);
    map.clear(&guard);
}

#[test]
fn negative_and_extreme_keys() {
    let map = ConcurrentIntObjectMap::new();
    let guard = map.guard();
    for &k in &[i32::MIN, -1, 0, 1, i32::MAX] {
        assert!(map.insert(k, k.to_string(), &guard).is_none());
    }
    for &k in &[i32::MIN, -1, 0, 1, i32::MAX] {
        assert_eq!(map.get(&k, &guard), Some(&k.to_string()));
    }
    assert_eq!(map.len(), 5);
}

#[test]
fn put_if_absent_is_idempotent() {
    let map = ConcurrentIntObjectMap::new();
    let guard = map.guard();
    assert_eq!(map.put_if_absent(42, "first", &guard), None);
    for _ in 0..10 {
        assert_eq!(map.put_if_absent(42, "later", &guard), Some(&"first"));
    }
    assert_eq!(map.len(), 1);
}

#[test]
fn many_keys_through_resizes() {
    let map = ConcurrentLongObjectMap::with_config(MapConfig::with_capacity(4)).unwrap();
    let guard = map.guard();
    for i in 0..10_000i64 {
        map.insert(i * 7919, i, &guard);
    }
    assert_eq!(map.len(), 10_000);
    for i in (0..10_000i64).step_by(3) {
        assert_eq!(map.remove(&(i * 7919), &guard), Some(&i));
    }
    for i in 0..10_000i64 {
        let expected = if i % 3 == 0 { None } else { Some(&i) };
        assert_eq!(map.get(&(i * 7919), &guard), expected);
    }
    assert_eq!(map.len(), 10_000 - 3334);
}

#[test]
fn colliding_keys_stay_reachable() {
    // every key lands in the same bin of any table up to 1 << 16 bins
    let map = HashMap::<u64, u64, IntHashing>::new();
    let guard = map.guard();
    let keys: Vec<u64> = (0..200).map(|i| i << 16 | i).collect();
    for (n, &k) in keys.iter().enumerate() {
        map.insert(k, n as u64, &guard);
    }
    for (n, k) in keys.iter().enumerate() {
        assert_eq!(map.get(k, &guard), Some(&(n as u64)));
    }
    for k in keys.iter().take(150) {
        assert!(map.remove(k, &guard).is_some());
    }
    assert_eq!(map.len(), 50);
    let mut left: Vec<u64> = map.keys(&guard).copied().collect();
    left.sort_unstable();
    let mut expected = keys[150..].to_vec();
    expected.sort_unstable();
    assert_eq!(left, expected);
}

#[test]
fn views_through_pinned_handle() {
    let map: ConcurrentIntObjectMap<i32> = (0..20).map(|i| (i, i * i)).collect();
    let pinned = map.pin();
    assert_eq!(pinned.key_set().len(), 20);
    assert!(pinned.values_view().contains(&361));
    assert!(pinned.entry_set().contains(&3, &9));
    pinned.key_set().retain(|k| k % 2 == 0);
    assert_eq!(pinned.elements().count(), 10);
}
