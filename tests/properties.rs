use concurrent_intmap::ConcurrentIntObjectMap;
use quickcheck::{quickcheck, Arbitrary, Gen};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Op {
    Insert(i32, u8),
    PutIfAbsent(i32, u8),
    Remove(i32),
    ReplaceIfEq(i32, u8, u8),
    ComputeIfAbsent(i32, u8),
    Clear,
}

// a small key space keeps collisions and repeated keys frequent
fn small_key<G: Gen>(g: &mut G) -> i32 {
    i32::from(u8::arbitrary(g) % 64) * if bool::arbitrary(g) { 64 } else { 1 }
}

impl Arbitrary for Op {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        match u8::arbitrary(g) % 20 {
            0..=7 => Op::Insert(small_key(g), u8::arbitrary(g)),
            8..=10 => Op::PutIfAbsent(small_key(g), u8::arbitrary(g)),
            11..=14 => Op::Remove(small_key(g)),
            15..=16 => Op::ReplaceIfEq(small_key(g), u8::arbitrary(g) % 4, u8::arbitrary(g)),
            17..=18 => Op::ComputeIfAbsent(small_key(g), u8::arbitrary(g)),
            _ => Op::Clear,
        }
    }
}

fn agrees_with_btreemap(ops: Vec<Op>) -> bool {
    let map = ConcurrentIntObjectMap::<u8>::new();
    let guard = map.guard();
    let mut model = BTreeMap::new();
    for op in ops {
        let same = match op {
            Op::Insert(k, v) => map.insert(k, v, &guard).copied() == model.insert(k, v),
            Op::PutIfAbsent(k, v) => {
                let expected = model.get(&k).copied();
                model.entry(k).or_insert(v);
                map.put_if_absent(k, v, &guard).copied() == expected
            }
            Op::Remove(k) => map.remove(&k, &guard).copied() == model.remove(&k),
            Op::ReplaceIfEq(k, old, new) => {
                let expected = model.get(&k) == Some(&old);
                if expected {
                    model.insert(k, new);
                }
                map.replace_if_eq(&k, &old, new, &guard) == expected
            }
            Op::ComputeIfAbsent(k, v) => {
                let expected = *model.entry(k).or_insert(v);
                map.compute_if_absent(k, |_| Some(v), &guard).copied() == Some(expected)
            }
            Op::Clear => {
                map.clear(&guard);
                model.clear();
                true
            }
        };
        if !same {
            return false;
        }
    }

    let mut entries: Vec<_> = map.iter(&guard).map(|(k, v)| (*k, *v)).collect();
    entries.sort_unstable();
    map.len() == model.len() && entries == model.into_iter().collect::<Vec<_>>()
}

#[test]
fn sequential_ops_match_model() {
    quickcheck(agrees_with_btreemap as fn(Vec<Op>) -> bool);
}

fn collect_then_iterate(keys: Vec<i32>) -> bool {
    let map: ConcurrentIntObjectMap<i32> = keys.iter().map(|&k| (k, k)).collect();
    let guard = map.guard();
    let mut seen: Vec<i32> = map.keys(&guard).copied().collect();
    seen.sort_unstable();
    let mut expected = keys;
    expected.sort_unstable();
    expected.dedup();
    seen == expected
}

#[test]
fn iteration_sees_every_key_once() {
    quickcheck(collect_then_iterate as fn(Vec<i32>) -> bool);
}
