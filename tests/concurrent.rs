use concurrent_intmap::{ConcurrentIntObjectMap, HashMap, IntHashing};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 8;

#[test]
fn same_keys_from_all_threads() {
    let map = Arc::new(ConcurrentIntObjectMap::<i32>::new());
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let map = map.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let guard = map.guard();
                for i in 0..1000 {
                    map.insert(i, i * 2, &guard);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let guard = map.guard();
    assert_eq!(map.len(), 1000);
    for i in 0..1000 {
        assert_eq!(map.get(&i, &guard), Some(&(i * 2)));
    }
}

#[test]
fn racing_put_if_absent_has_one_winner() {
    let map = Arc::new(ConcurrentIntObjectMap::<usize>::new());
    let barrier = Arc::new(Barrier::new(THREADS));
    let winners = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = map.clone();
            let barrier = barrier.clone();
            let winners = winners.clone();
            thread::spawn(move || {
                barrier.wait();
                let guard = map.guard();
                if map.put_if_absent(42, t, &guard).is_none() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(map.len(), 1);
    let guard = map.guard();
    assert!(*map.get(&42, &guard).unwrap() < THREADS);
}

#[test]
fn no_lost_updates_under_resize() {
    // a tiny first table forces many concurrent transfers
    let map = Arc::new(HashMap::<i32, i32, IntHashing>::with_capacity(1));
    let per_thread = 5_000;
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = map.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    let guard = map.guard();
                    let key = (t * per_thread + i) as i32;
                    assert!(map.insert(key, key, &guard).is_none());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let guard = map.guard();
    assert_eq!(map.len(), THREADS * per_thread);
    assert_eq!(map.iter(&guard).count(), THREADS * per_thread);
    for key in 0..(THREADS * per_thread) as i32 {
        assert_eq!(map.get(&key, &guard), Some(&key));
    }
}

#[test]
fn readers_see_monotonic_values() {
    let map = Arc::new(ConcurrentIntObjectMap::<u64>::new());
    {
        let guard = map.guard();
        for k in 0..64 {
            map.insert(k, 0, &guard);
        }
    }

    let writer = {
        let map = map.clone();
        thread::spawn(move || {
            for v in 1..=2_000u64 {
                let guard = map.guard();
                for k in 0..64 {
                    map.insert(k, v, &guard);
                }
                // unrelated churn to trigger resizes
                map.insert(1_000 + v as i32, v, &guard);
            }
        })
    };

    let readers: Vec<_> = (0..THREADS - 1)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                let mut last = [0u64; 64];
                for _ in 0..2_000 {
                    let guard = map.guard();
                    for k in 0..64 {
                        let v = *map.get(&(k as i32), &guard).expect("key never removed");
                        assert!(v >= last[k], "value of {} went back", k);
                        last[k] = v;
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    let guard = map.guard();
    assert_eq!(map.get(&0, &guard), Some(&2_000));
}

#[test]
fn concurrent_removal_and_insertion() {
    let map = Arc::new(ConcurrentIntObjectMap::<i32>::new());
    {
        let guard = map.guard();
        for i in 0..10_000 {
            map.insert(i, i, &guard);
        }
    }
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = map.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let guard = map.guard();
                for i in (t as i32..10_000).step_by(THREADS) {
                    assert_eq!(map.remove(&i, &guard), Some(&i));
                    map.insert(i + 10_000, i, &guard);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let guard = map.guard();
    assert_eq!(map.len(), 10_000);
    assert!(map.keys(&guard).all(|k| *k >= 10_000));
}

#[test]
fn compute_if_absent_runs_once_per_key() {
    let map = Arc::new(ConcurrentIntObjectMap::<usize>::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let map = map.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let guard = map.guard();
                for k in 0..500 {
                    let v = map.compute_if_absent(
                        k,
                        |k| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Some(*k as usize)
                        },
                        &guard,
                    );
                    assert_eq!(v, Some(&(k as usize)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 500);
    assert_eq!(map.len(), 500);
}

#[test]
fn iteration_during_updates() {
    let map = Arc::new(ConcurrentIntObjectMap::<i32>::new());
    {
        let guard = map.guard();
        for i in 0..1_000 {
            map.insert(i, i, &guard);
        }
    }
    let writer = {
        let map = map.clone();
        thread::spawn(move || {
            let guard = map.guard();
            for i in 1_000..20_000 {
                map.insert(i, i, &guard);
                map.remove(&(i - 1), &guard);
            }
        })
    };

    // keys below 999 are never touched, so every walk must see all of them
    for _ in 0..20 {
        let guard = map.guard();
        let stable = map.keys(&guard).filter(|k| **k < 999).count();
        assert_eq!(stable, 999);
    }
    writer.join().unwrap();
}
