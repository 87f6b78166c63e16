use concurrent_intmap::factory;
use concurrent_intmap::refmap::{Tracked, WeakValueMap};
use concurrent_intmap::Error;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn unreachable_values_are_reclaimed_by_later_updates() {
    let map = factory::create_int_key_weak_value_map();
    let live: Vec<_> = (0..100).map(Tracked::new).collect();
    for (k, v) in live.iter().enumerate() {
        map.put(k as i32, v);
    }
    assert_eq!(map.len(), 100);

    let (keep, gone): (Vec<_>, Vec<_>) = live.into_iter().partition(|v| **v % 2 == 0);
    drop(gone);
    for k in (1..100).step_by(2) {
        assert!(map.get(k).is_none());
    }

    // any update drains the queue, not just one on the affected keys
    map.put(1_000, &keep[0]);
    assert_eq!(map.len(), 51);
    assert_eq!(map.values().len(), 51);
    for v in &keep {
        assert_eq!(*map.get(**v).unwrap(), **v);
    }
}

#[test]
fn reachable_values_stay() {
    let map = WeakValueMap::new();
    let value = Tracked::new(vec![1, 2, 3]);
    map.put(7, &value);
    for k in 0..1_000 {
        map.put(k + 10, &Tracked::new(vec![k]));
    }
    assert_eq!(map.get(7).as_deref(), Some(&vec![1, 2, 3]));
}

#[test]
fn membership_is_pointless() {
    let map = factory::create_int_key_soft_value_map::<u32>();
    match map.contains_key(3) {
        Err(Error::PointlessOperation { operation }) => assert_eq!(operation, "contains_key"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        map.contains_value(&Tracked::new(3)),
        Err(Error::PointlessOperation { .. })
    ));
}

#[test]
fn concurrent_cache_or_get_agrees() {
    let map = Arc::new(WeakValueMap::<String>::new());
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = map.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..50)
                    .map(|k| map.cache_or_get(k, Tracked::new(format!("{}-{}", k, t))))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let results: Vec<Vec<Tracked<String>>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    // every thread still holds its result, so all of them saw the same value
    for k in 0..50 {
        let first = &results[0][k];
        assert!(results.iter().all(|r| Tracked::ptr_eq(&r[k], first)));
        assert!(first.starts_with(&format!("{}-", k)));
    }
}
