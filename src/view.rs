use crate::iter::{Iter, Keys, Values};
use crate::strategy::HashingStrategy;
use crate::HashMap;
use crossbeam_epoch::Guard;
use std::fmt::{self, Debug, Formatter};

impl<K, V, H> HashMap<K, V, H> {
    /// The keys of the map as a set. Removing from it removes from the map.
    pub fn key_set<'g>(&'g self, guard: &'g Guard) -> KeySet<'g, K, V, H> {
        KeySet { map: self, guard }
    }

    /// The values of the map as a collection.
    pub fn values_view<'g>(&'g self, guard: &'g Guard) -> ValuesView<'g, K, V, H> {
        ValuesView { map: self, guard }
    }

    /// The entries of the map as a set of key-value pairs.
    pub fn entry_set<'g>(&'g self, guard: &'g Guard) -> EntrySet<'g, K, V, H> {
        EntrySet { map: self, guard }
    }
}

macro_rules! view_common {
    ($view:ident) => {
        impl<'g, K, V, H> $view<'g, K, V, H> {
            pub fn len(&self) -> usize {
                self.map.len()
            }

            pub fn is_empty(&self) -> bool {
                self.map.is_empty()
            }
        }

        impl<'g, K, V, H> $view<'g, K, V, H>
        where
            K: Clone,
            H: HashingStrategy<K>,
        {
            /// Removes every entry of the backing map.
            pub fn clear(&self) {
                self.map.clear(self.guard);
            }
        }

        impl<K, V, H> Clone for $view<'_, K, V, H> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<K, V, H> Copy for $view<'_, K, V, H> {}
    };
}

/// Set view of the keys of a [`HashMap`].
pub struct KeySet<'g, K, V, H> {
    map: &'g HashMap<K, V, H>,
    guard: &'g Guard,
}

view_common!(KeySet);

impl<'g, K, V, H> KeySet<'g, K, V, H> {
    pub fn iter(&self) -> Keys<'g, K, V> {
        self.map.keys(self.guard)
    }
}

impl<'g, K, V, H> KeySet<'g, K, V, H>
where
    H: HashingStrategy<K>,
{
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key, self.guard)
    }
}

impl<'g, K, V, H> KeySet<'g, K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send,
    H: HashingStrategy<K>,
{
    /// Removes `key` from the map, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.map.remove(key, self.guard).is_some()
    }

    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&K) -> bool,
    {
        self.map.retain(|k, _| f(k), self.guard);
    }
}

impl<'g, K, V, H> IntoIterator for KeySet<'g, K, V, H> {
    type IntoIter = Keys<'g, K, V>;
    type Item = &'g K;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Debug, V, H> Debug for KeySet<'_, K, V, H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// View of the values of a [`HashMap`].
pub struct ValuesView<'g, K, V, H> {
    map: &'g HashMap<K, V, H>,
    guard: &'g Guard,
}

view_common!(ValuesView);

impl<'g, K, V, H> ValuesView<'g, K, V, H> {
    pub fn iter(&self) -> Values<'g, K, V> {
        self.map.values(self.guard)
    }
}

impl<'g, K, V, H> ValuesView<'g, K, V, H>
where
    V: PartialEq,
{
    pub fn contains(&self, value: &V) -> bool {
        self.iter().any(|v| v == value)
    }
}

impl<'g, K, V, H> ValuesView<'g, K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send + PartialEq,
    H: HashingStrategy<K>,
{
    /// Removes one entry mapped to `value`, returning whether there was one.
    pub fn remove(&self, value: &V) -> bool {
        self.map
            .iter(self.guard)
            .filter(|(_, v)| *v == value)
            .any(|(k, v)| {
                self.map
                    .remove_if(k, |current| std::ptr::eq(current, v), self.guard)
            })
    }
}

impl<'g, K, V, H> ValuesView<'g, K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send,
    H: HashingStrategy<K>,
{
    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&V) -> bool,
    {
        self.map.retain(|_, v| f(v), self.guard);
    }
}

impl<'g, K, V, H> IntoIterator for ValuesView<'g, K, V, H> {
    type IntoIter = Values<'g, K, V>;
    type Item = &'g V;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V: Debug, H> Debug for ValuesView<'_, K, V, H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Set view of the entries of a [`HashMap`].
pub struct EntrySet<'g, K, V, H> {
    map: &'g HashMap<K, V, H>,
    guard: &'g Guard,
}

view_common!(EntrySet);

impl<'g, K, V, H> EntrySet<'g, K, V, H> {
    pub fn iter(&self) -> Iter<'g, K, V> {
        self.map.iter(self.guard)
    }
}

impl<'g, K, V, H> EntrySet<'g, K, V, H>
where
    V: PartialEq,
    H: HashingStrategy<K>,
{
    /// Whether `key` is currently mapped to `value`.
    pub fn contains(&self, key: &K, value: &V) -> bool {
        self.map.get(key, self.guard).map_or(false, |v| v == value)
    }
}

impl<'g, K, V, H> EntrySet<'g, K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send + PartialEq,
    H: HashingStrategy<K>,
{
    /// Removes `key` if it is mapped to `value`.
    pub fn remove(&self, key: &K, value: &V) -> bool {
        self.map.remove_if_eq(key, value, self.guard)
    }
}

impl<'g, K, V, H> EntrySet<'g, K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send,
    H: HashingStrategy<K>,
{
    pub fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.map.retain(f, self.guard);
    }
}

impl<'g, K, V, H> IntoIterator for EntrySet<'g, K, V, H> {
    type IntoIter = Iter<'g, K, V>;
    type Item = (&'g K, &'g V);

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Debug, V: Debug, H> Debug for EntrySet<'_, K, V, H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::ConcurrentIntObjectMap;

    fn sample() -> ConcurrentIntObjectMap<i32> {
        (0..10).map(|i| (i, i % 3)).collect()
    }

    #[test]
    fn key_set_removes_through() {
        let map = sample();
        let guard = map.guard();
        let keys = map.key_set(&guard);
        assert_eq!(keys.len(), 10);
        assert!(keys.contains(&4));
        assert!(keys.remove(&4));
        assert!(!keys.remove(&4));
        assert!(!map.contains_key(&4, &guard));
        keys.retain(|k| *k < 5);
        assert_eq!(map.len(), 4);
        assert_eq!(keys.iter().count(), 4);
    }

    #[test]
    fn values_view_removes_one_entry() {
        let map = sample();
        let guard = map.guard();
        let values = map.values_view(&guard);
        assert!(values.contains(&2));
        assert!(!values.contains(&3));
        // 2, 5 and 8 map to 2
        assert!(values.remove(&2));
        assert_eq!(map.len(), 9);
        assert_eq!(values.iter().filter(|v| **v == 2).count(), 2);
        values.retain(|v| *v != 0);
        assert!(!values.contains(&0));
        assert!(!values.remove(&0));
    }

    #[test]
    fn entry_set_matches_pairs() {
        let map = sample();
        let guard = map.guard();
        let entries = map.entry_set(&guard);
        assert!(entries.contains(&7, &1));
        assert!(!entries.contains(&7, &2));
        assert!(!entries.remove(&7, &2));
        assert!(entries.remove(&7, &1));
        assert_eq!(entries.iter().count(), 9);
        entries.clear();
        assert!(entries.is_empty());
    }
}
