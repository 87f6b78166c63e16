//! Integer-keyed maps whose values can be reclaimed.
//!
//! A [`RefValueMap`] stores a [`WeakValue`] or [`SoftValue`] for each key
//! instead of the value itself. Values are handed in and out as [`Tracked`]
//! handles; once the last handle to a value is dropped (and, for soft
//! references, [`RefValueMap::release_soft_references`] has run), the value
//! goes away and the entry is purged by the next update of the map.

mod reference;

pub use reference::{SoftValue, Tracked, ValueReference, WeakValue};

use crate::error::{Error, Result};
use crate::strategy::IntHashing;
use crate::{HashMap, TryInsertError};
use log::trace;
use reference::ReclaimQueue;
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;

/// A concurrent `i32`-keyed map holding its values through reclaimable
/// references of type `R`.
pub struct RefValueMap<V, R = WeakValue<V>> {
    map: HashMap<i32, R, IntHashing>,
    queue: Arc<ReclaimQueue>,
    _value: PhantomData<fn(V) -> V>,
}

/// Map with weakly held values.
pub type WeakValueMap<V> = RefValueMap<V, WeakValue<V>>;

/// Map with softly held values.
pub type SoftValueMap<V> = RefValueMap<V, SoftValue<V>>;

impl<V, R> Default for RefValueMap<V, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, R> RefValueMap<V, R> {
    pub fn new() -> Self {
        Self::with_map(HashMap::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_map(HashMap::with_capacity(capacity))
    }

    fn with_map(map: HashMap<i32, R, IntHashing>) -> Self {
        RefValueMap {
            map,
            queue: Arc::new(ReclaimQueue::default()),
            _value: PhantomData,
        }
    }

    /// Number of stored entries, including ones whose value is already gone
    /// but not yet purged.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Always fails: the value may be reclaimed before the answer arrives.
    pub fn contains_key(&self, _key: i32) -> Result<bool> {
        Err(Error::PointlessOperation {
            operation: "contains_key",
        })
    }

    /// Always fails: the value may be reclaimed before the answer arrives.
    pub fn contains_value(&self, _value: &Tracked<V>) -> Result<bool> {
        Err(Error::PointlessOperation {
            operation: "contains_value",
        })
    }
}

impl<V, R> RefValueMap<V, R>
where
    V: Send + Sync + 'static,
    R: ValueReference<V>,
{
    fn reference(&self, key: i32, value: &Tracked<V>) -> R {
        value.watch(&self.queue, key);
        R::new(value, self.queue.next_id())
    }

    /// Removes the entries whose value has been reclaimed, returning how many
    /// were removed.
    pub fn purge(&self) -> usize {
        let keys = self.queue.drain();
        if keys.is_empty() {
            return 0;
        }
        let guard = self.map.guard();
        // a reported key may have been stored again since, keep live values
        let removed = keys
            .iter()
            .filter(|key| self.map.remove_if(key, |r| r.get().is_none(), &guard))
            .count();
        trace!("purged {} of {} reclaimed keys", removed, keys.len());
        removed
    }

    pub fn get(&self, key: i32) -> Option<Tracked<V>> {
        let guard = self.map.guard();
        self.map.get(&key, &guard)?.get()
    }

    /// Maps `key` to `value`, returning the previous value if it is still
    /// alive.
    pub fn put(&self, key: i32, value: &Tracked<V>) -> Option<Tracked<V>> {
        self.purge();
        let guard = self.map.guard();
        let reference = self.reference(key, value);
        self.map.insert(key, reference, &guard)?.get()
    }

    /// Maps `key` to `value` unless it already has a live value, which is
    /// returned instead. A reclaimed value counts as absent.
    pub fn put_if_absent(&self, key: i32, value: &Tracked<V>) -> Option<Tracked<V>> {
        self.purge();
        let guard = self.map.guard();
        let mut reference = self.reference(key, value);
        loop {
            match self.map.try_insert(key, reference, &guard) {
                Ok(_) => return None,
                Err(TryInsertError {
                    current,
                    not_inserted,
                }) => {
                    if let Some(alive) = current.get() {
                        return Some(alive);
                    }
                    // the stored value died, take its place
                    let dead = current.id();
                    let fresh = self.reference(key, value);
                    if self.map.replace_if(&key, |r| r.id() == dead, fresh, &guard) {
                        return None;
                    }
                    reference = not_inserted;
                }
            }
        }
    }

    /// The live value of `key`, storing `value` first if there is none.
    pub fn cache_or_get(&self, key: i32, value: Tracked<V>) -> Tracked<V> {
        if let Some(alive) = self.get(key) {
            return alive;
        }
        match self.put_if_absent(key, &value) {
            Some(alive) => alive,
            None => value,
        }
    }

    /// Removes `key`, returning its value if it is still alive.
    pub fn remove(&self, key: i32) -> Option<Tracked<V>> {
        self.purge();
        let guard = self.map.guard();
        self.map.remove(&key, &guard)?.get()
    }

    /// Removes `key` if it maps to `value` itself.
    pub fn remove_value(&self, key: i32, value: &Tracked<V>) -> bool {
        self.purge();
        let guard = self.map.guard();
        self.map.remove_if(&key, |r| r.refers_to(value), &guard)
    }

    /// Replaces the value of `key` if it has one, returning the old value if
    /// it is still alive.
    pub fn replace(&self, key: i32, value: &Tracked<V>) -> Option<Tracked<V>> {
        self.purge();
        let guard = self.map.guard();
        let reference = self.reference(key, value);
        self.map.replace(&key, reference, &guard)?.get()
    }

    /// Replaces the value of `key` with `new` if it maps to `old` itself.
    pub fn replace_value(&self, key: i32, old: &Tracked<V>, new: &Tracked<V>) -> bool {
        self.purge();
        let guard = self.map.guard();
        let reference = self.reference(key, new);
        self.map
            .replace_if(&key, |r| r.refers_to(old), reference, &guard)
    }

    pub fn clear(&self) {
        let guard = self.map.guard();
        self.map.clear(&guard);
        drop(guard);
        // keys reported meanwhile may belong to entries stored after the clear
        self.purge();
    }

    /// Keys present at some point during the call.
    pub fn keys(&self) -> Vec<i32> {
        self.purge();
        let guard = self.map.guard();
        self.map.keys_snapshot(&guard)
    }

    /// The values still alive.
    pub fn values(&self) -> Vec<Tracked<V>> {
        let guard = self.map.guard();
        self.map.values(&guard).filter_map(|r| r.get()).collect()
    }

    /// Same as [`values`](Self::values).
    pub fn elements(&self) -> Vec<Tracked<V>> {
        self.values()
    }

    /// The entries whose value is still alive.
    pub fn entries(&self) -> Vec<(i32, Tracked<V>)> {
        let guard = self.map.guard();
        self.map
            .iter(&guard)
            .filter_map(|(k, r)| r.get().map(|v| (*k, v)))
            .collect()
    }

    /// Lets go of every soft hold, so that values nobody else references
    /// are dropped. Weak references are unaffected.
    pub fn release_soft_references(&self) {
        let guard = self.map.guard();
        for reference in self.map.values(&guard) {
            reference.release();
        }
        drop(guard);
        self.purge();
    }
}

impl<V, R> Debug for RefValueMap<V, R>
where
    V: Debug + Send + Sync + 'static,
    R: ValueReference<V>,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_live_while_handles_do() {
        let map = WeakValueMap::new();
        let value = Tracked::new(String::from("a"));
        assert!(map.put(1, &value).is_none());
        assert_eq!(map.get(1).as_deref().map(String::as_str), Some("a"));
        drop(value);
        assert!(map.get(1).is_none());
        assert_eq!(map.len(), 1);
        assert_eq!(map.purge(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn updates_purge_reclaimed_entries() {
        let map = WeakValueMap::new();
        let kept = Tracked::new(1);
        for key in 0..10 {
            map.put(key, &Tracked::new(key));
        }
        map.put(100, &kept);
        // an update on an unrelated key removes the dead entries
        map.put(200, &kept);
        assert_eq!(map.len(), 2);
        assert_eq!(map.keys().len(), 2);
    }

    #[test]
    fn stale_reports_leave_replacements_alone() {
        let map = WeakValueMap::new();
        let first = Tracked::new("first");
        let second = Tracked::new("second");
        map.put(1, &first);
        assert_eq!(map.put(1, &second).as_deref(), Some(&"first"));
        drop(first);
        assert_eq!(map.purge(), 0);
        assert_eq!(map.get(1).as_deref(), Some(&"second"));
    }

    #[test]
    fn put_if_absent_replaces_dead_values() {
        let map = WeakValueMap::new();
        let old = Tracked::new(1);
        assert!(map.put_if_absent(5, &old).is_none());
        let new = Tracked::new(2);
        assert_eq!(map.put_if_absent(5, &new).as_deref(), Some(&1));
        drop(old);
        // the dead entry has been purged or is replaced in place
        assert!(map.put_if_absent(5, &new).is_none());
        assert_eq!(map.get(5).as_deref(), Some(&2));
    }

    #[test]
    fn dead_entry_is_overwritten_before_purge() {
        let map = WeakValueMap::new();
        let old = Tracked::new(1);
        map.put(5, &old);
        drop(old);
        // forget the reported key so the dead reference stays in place
        map.queue.drain();
        let new = Tracked::new(2);
        assert!(map.put_if_absent(5, &new).is_none());
        assert_eq!(map.get(5).as_deref(), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn cache_or_get_prefers_live_value() {
        let map = WeakValueMap::new();
        let first = map.cache_or_get(3, Tracked::new("x"));
        let second = map.cache_or_get(3, Tracked::new("y"));
        assert!(Tracked::ptr_eq(&first, &second));
        drop(first);
        drop(second);
        let third = map.cache_or_get(3, Tracked::new("z"));
        assert_eq!(*third, "z");
    }

    #[test]
    fn conditional_updates_match_identity() {
        let map = WeakValueMap::new();
        let a = Tracked::new(1);
        let equal = Tracked::new(1);
        let b = Tracked::new(2);
        map.put(1, &a);
        assert!(!map.remove_value(1, &equal));
        assert!(!map.replace_value(1, &equal, &b));
        assert!(map.replace_value(1, &a, &b));
        assert_eq!(map.replace(1, &a).as_deref(), Some(&2));
        assert!(map.replace(2, &a).is_none());
        assert!(map.remove_value(1, &a));
        assert!(map.remove(1).is_none());
    }

    #[test]
    fn membership_queries_are_refused() {
        let map = WeakValueMap::<u8>::new();
        assert_eq!(
            map.contains_key(1),
            Err(Error::PointlessOperation {
                operation: "contains_key"
            })
        );
        assert!(map.contains_value(&Tracked::new(1)).is_err());
    }

    #[test]
    fn soft_values_survive_until_released() {
        let map = SoftValueMap::new();
        map.put(1, &Tracked::new(10));
        let kept = Tracked::new(20);
        map.put(2, &kept);
        assert_eq!(map.get(1).as_deref(), Some(&10));
        map.release_soft_references();
        assert!(map.get(1).is_none());
        assert_eq!(map.get(2).as_deref(), Some(&20));
        assert_eq!(map.len(), 1);
        assert_eq!(map.entries().len(), 1);
    }

    #[test]
    fn clear_leaves_nothing_to_purge() {
        let map = WeakValueMap::new();
        map.put(1, &Tracked::new(1));
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.purge(), 0);
        assert!(map.values().is_empty());
    }

    #[test]
    fn repeated_puts_report_once() {
        let map = WeakValueMap::new();
        let value = Tracked::new(1);
        for _ in 0..10_000 {
            map.put(1, &value);
        }
        for _ in 0..100 {
            map.put_if_absent(1, &value);
            map.replace(1, &value);
            map.replace_value(1, &value, &value);
        }
        drop(value);
        assert_eq!(map.queue.drain(), vec![1]);
    }

    #[test]
    fn clear_racing_puts_keeps_reclaiming() {
        let map = Arc::new(WeakValueMap::new());
        let clearer = {
            let map = map.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    map.clear();
                }
            })
        };
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        // the value dies as soon as it is stored
                        map.put(t * 16 + i % 16, &Tracked::new(i));
                    }
                })
            })
            .collect();
        clearer.join().unwrap();
        for writer in writers {
            writer.join().unwrap();
        }

        map.purge();
        assert!(map.is_empty());
        assert!(map.keys().is_empty());
    }
}
