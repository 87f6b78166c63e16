use crate::iter::*;
use crate::strategy::HashingStrategy;
use crate::view::{EntrySet, KeySet, ValuesView};
use crate::{GuardRef, HashMap, TryInsertError};
use crossbeam_epoch::Guard;
use std::fmt::{self, Debug, Formatter};
use std::ops::Index;

/// A map handle that carries its own guard, so calls need no `&Guard`.
///
/// Holding the handle keeps every reference it returned alive, so do not
/// keep one around for long.
pub struct HashMapRef<'map, K, V, H = crate::DefaultHashing> {
    pub(crate) map: &'map HashMap<K, V, H>,
    guard: GuardRef<'map>,
}

impl<K, V, H> HashMap<K, V, H> {
    /// A handle pinned to a fresh guard.
    pub fn pin(&self) -> HashMapRef<'_, K, V, H> {
        HashMapRef {
            guard: GuardRef::Owned(self.guard()),
            map: self,
        }
    }

    pub fn with_guard<'g>(&'g self, guard: &'g Guard) -> HashMapRef<'g, K, V, H> {
        HashMapRef {
            map: self,
            guard: GuardRef::Ref(guard),
        }
    }
}

impl<K, V, H> HashMapRef<'_, K, V, H> {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        self.map.iter(&self.guard)
    }

    pub fn keys(&self) -> Keys<'_, K, V> {
        self.map.keys(&self.guard)
    }

    pub fn values(&self) -> Values<'_, K, V> {
        self.map.values(&self.guard)
    }

    pub fn elements(&self) -> Values<'_, K, V> {
        self.map.elements(&self.guard)
    }

    pub fn key_set(&self) -> KeySet<'_, K, V, H> {
        self.map.key_set(&self.guard)
    }

    pub fn values_view(&self) -> ValuesView<'_, K, V, H> {
        self.map.values_view(&self.guard)
    }

    pub fn entry_set(&self) -> EntrySet<'_, K, V, H> {
        self.map.entry_set(&self.guard)
    }
}

impl<K, V, H> HashMapRef<'_, K, V, H>
where
    K: Clone,
    H: HashingStrategy<K>,
{
    pub fn reserve(&self, additional: usize) {
        self.map.reserve(additional, &self.guard)
    }

    pub fn clear(&self) {
        self.map.clear(&self.guard);
    }
}

impl<K, V, H> HashMapRef<'_, K, V, H>
where
    H: HashingStrategy<K>,
{
    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key, &self.guard)
    }

    #[inline]
    pub fn get<'g>(&'g self, key: &K) -> Option<&'g V> {
        self.map.get(key, &self.guard)
    }

    #[inline]
    pub fn get_key_value<'g>(&'g self, key: &K) -> Option<(&'g K, &'g V)> {
        self.map.get_key_value(key, &self.guard)
    }

    pub fn get_or_default<'g>(&'g self, key: &K, default: &'g V) -> &'g V {
        self.map.get_or_default(key, default, &self.guard)
    }
}

impl<K, V, H> HashMapRef<'_, K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send,
    H: HashingStrategy<K>,
{
    pub fn insert(&self, key: K, value: V) -> Option<&'_ V> {
        self.map.insert(key, value, &self.guard)
    }

    #[inline]
    pub fn try_insert(&self, key: K, value: V) -> Result<&'_ V, TryInsertError<'_, V>> {
        self.map.try_insert(key, value, &self.guard)
    }

    pub fn put_if_absent(&self, key: K, value: V) -> Option<&'_ V> {
        self.map.put_if_absent(key, value, &self.guard)
    }

    pub fn cache_or_get(&self, key: K, value: V) -> &'_ V {
        self.map.cache_or_get(key, value, &self.guard)
    }

    pub fn compute_if_absent<'g, F>(&'g self, key: K, mapping_function: F) -> Option<&'g V>
    where
        F: FnOnce(&K) -> Option<V>,
    {
        self.map
            .compute_if_absent(key, mapping_function, &self.guard)
    }

    pub fn compute_if_present<'g, F>(&'g self, key: &K, remapping_function: F) -> Option<&'g V>
    where
        F: FnOnce(&K, &V) -> Option<V>,
    {
        self.map
            .compute_if_present(key, remapping_function, &self.guard)
    }

    pub fn remove<'g>(&'g self, key: &K) -> Option<&'g V> {
        self.map.remove(key, &self.guard)
    }

    pub fn remove_entry<'g>(&'g self, key: &K) -> Option<(&'g K, &'g V)> {
        self.map.remove_entry(key, &self.guard)
    }

    pub fn replace<'g>(&'g self, key: &K, value: V) -> Option<&'g V> {
        self.map.replace(key, value, &self.guard)
    }

    pub fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.map.retain(f, &self.guard);
    }
}

impl<K, V, H> HashMapRef<'_, K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send + PartialEq,
    H: HashingStrategy<K>,
{
    pub fn remove_if_eq(&self, key: &K, expected: &V) -> bool {
        self.map.remove_if_eq(key, expected, &self.guard)
    }

    pub fn replace_if_eq(&self, key: &K, expected: &V, value: V) -> bool {
        self.map.replace_if_eq(key, expected, value, &self.guard)
    }
}

impl<'g, K, V, H> IntoIterator for &'g HashMapRef<'_, K, V, H> {
    type IntoIter = Iter<'g, K, V>;
    type Item = (&'g K, &'g V);

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter(&self.guard)
    }
}

impl<K, V, H> Debug for HashMapRef<'_, K, V, H>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self).finish()
    }
}

impl<K, V, H> Clone for HashMapRef<'_, K, V, H> {
    fn clone(&self) -> Self {
        self.map.pin()
    }
}

impl<K, V, H> PartialEq for HashMapRef<'_, K, V, H>
where
    V: PartialEq,
    H: HashingStrategy<K>,
{
    fn eq(&self, other: &Self) -> bool {
        self.map.guarded_eq(other.map, &self.guard, &other.guard)
    }
}

impl<K, V, H> PartialEq<HashMap<K, V, H>> for HashMapRef<'_, K, V, H>
where
    V: PartialEq,
    H: HashingStrategy<K>,
{
    fn eq(&self, other: &HashMap<K, V, H>) -> bool {
        self.map.guarded_eq(other, &self.guard, &other.guard())
    }
}

impl<K, V, H> PartialEq<HashMapRef<'_, K, V, H>> for HashMap<K, V, H>
where
    V: PartialEq,
    H: HashingStrategy<K>,
{
    fn eq(&self, other: &HashMapRef<'_, K, V, H>) -> bool {
        self.guarded_eq(other.map, &self.guard(), &other.guard)
    }
}

impl<K, V, H> Eq for HashMapRef<'_, K, V, H>
where
    V: Eq,
    H: HashingStrategy<K>,
{
}

impl<K, V, H> Index<&'_ K> for HashMapRef<'_, K, V, H>
where
    H: HashingStrategy<K>,
{
    type Output = V;

    fn index(&self, key: &K) -> &V {
        self.get(key).expect("no entry found for key")
    }
}

#[cfg(test)]
mod tests {
    use crate::ConcurrentIntObjectMap;

    #[test]
    fn pinned_operations() {
        let map = ConcurrentIntObjectMap::new();
        let map = map.pin();
        assert_eq!(map.insert(1, "a"), None);
        assert_eq!(map.put_if_absent(1, "b"), Some(&"a"));
        assert_eq!(*map.cache_or_get(2, "c"), "c");
        assert_eq!(map[&2], "c");
        assert!(map.replace_if_eq(&2, &"c", "d"));
        assert_eq!(map.get(&2), Some(&"d"));
        assert_eq!(map.compute_if_absent(3, |_| Some("e")), Some(&"e"));
        assert_eq!(map.len(), 3);
        assert!(map.remove_if_eq(&3, &"e"));
        assert_eq!(map.remove(&1), Some(&"a"));
        assert_eq!(format!("{:?}", map), r#"{2: "d"}"#);
    }

    #[test]
    fn refs_compare_with_maps() {
        let a: ConcurrentIntObjectMap<i32> = (0..10).map(|i| (i, i)).collect();
        let b: ConcurrentIntObjectMap<i32> = (0..10).map(|i| (i, i)).collect();
        assert_eq!(a.pin(), b.pin());
        assert_eq!(a.pin(), b);
        assert_eq!(a, b.pin());
        b.pin().insert(0, 1);
        assert_ne!(a.pin(), b.pin());
    }

    #[test]
    #[should_panic(expected = "no entry found for key")]
    fn index_missing_key() {
        let map = ConcurrentIntObjectMap::<i32>::new();
        let _ = map.pin()[&1];
    }
}
