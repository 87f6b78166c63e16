use crate::epoch::Guard;
use crate::iter::Keys;
use crate::strategy::HashingStrategy;
use crate::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::iter::FromIterator;

/// A concurrent set, backed by a [`HashMap`] with `()` values.
pub struct HashSet<T, H = crate::DefaultHashing> {
    pub(crate) map: HashMap<T, (), H>,
}

impl<T, H> HashSet<T, H>
where
    H: Default,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_strategy(capacity, H::default())
    }
}

impl<T, H> Default for HashSet<T, H>
where
    H: Default,
{
    fn default() -> Self {
        Self::with_strategy(H::default())
    }
}

impl<T, H> HashSet<T, H> {
    pub fn with_strategy(strategy: H) -> Self {
        Self {
            map: HashMap::with_strategy(strategy),
        }
    }

    pub fn with_capacity_and_strategy(capacity: usize, strategy: H) -> Self {
        Self {
            map: HashMap::with_capacity_and_strategy(capacity, strategy),
        }
    }

    pub fn strategy(&self) -> &H {
        self.map.strategy()
    }

    pub fn guard(&self) -> crate::epoch::Guard {
        self.map.guard()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Keys<'g, T, ()> {
        self.map.keys(guard)
    }
}

impl<T, H> HashSet<T, H>
where
    H: HashingStrategy<T>,
{
    #[inline]
    pub fn contains(&self, value: &T, guard: &Guard) -> bool {
        self.map.contains_key(value, guard)
    }

    /// The stored element equal to `value` under the set's strategy.
    pub fn get<'g>(&'g self, value: &T, guard: &'g Guard) -> Option<&'g T> {
        self.map.get_key_value(value, guard).map(|(k, _)| k)
    }

    pub fn is_disjoint(&self, other: &HashSet<T, H>, our_guard: &Guard, their_guard: &Guard) -> bool {
        !self
            .iter(our_guard)
            .any(|value| other.contains(value, their_guard))
    }

    pub fn is_subset(&self, other: &HashSet<T, H>, our_guard: &Guard, their_guard: &Guard) -> bool {
        self.iter(our_guard)
            .all(|value| other.contains(value, their_guard))
    }

    pub fn is_superset(&self, other: &HashSet<T, H>, our_guard: &Guard, their_guard: &Guard) -> bool {
        other.is_subset(self, their_guard, our_guard)
    }

    pub(crate) fn guarded_eq(&self, other: &Self, our_guard: &Guard, their_guard: &Guard) -> bool {
        self.map.guarded_eq(&other.map, our_guard, their_guard)
    }
}

impl<T, H> HashSet<T, H>
where
    T: 'static + Sync + Send + Clone,
    H: HashingStrategy<T>,
{
    /// Adds `value`, returning whether it was new.
    pub fn insert(&self, value: T, guard: &Guard) -> bool {
        self.map.put_if_absent(value, (), guard).is_none()
    }

    pub fn remove(&self, value: &T, guard: &Guard) -> bool {
        self.map.remove(value, guard).is_some()
    }

    /// Removes `value`, returning the element that was stored for it.
    pub fn take<'g>(&'g self, value: &T, guard: &'g Guard) -> Option<&'g T> {
        self.map.remove_entry(value, guard).map(|(k, _)| k)
    }

    pub fn retain<F>(&self, mut f: F, guard: &Guard)
    where
        F: FnMut(&T) -> bool,
    {
        self.map.retain(|value, ()| f(value), guard)
    }

    pub fn clear(&self, guard: &Guard) {
        self.map.clear(guard)
    }

    pub fn reserve(&self, additional: usize, guard: &Guard) {
        self.map.reserve(additional, guard)
    }
}

impl<T, H> PartialEq for HashSet<T, H>
where
    H: HashingStrategy<T>,
{
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl<T, H> Eq for HashSet<T, H> where H: HashingStrategy<T> {}

impl<T, H> fmt::Debug for HashSet<T, H>
where
    T: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_set().entries(self.iter(&guard)).finish()
    }
}

impl<T, H> Extend<T> for &HashSet<T, H>
where
    T: 'static + Sync + Send + Clone,
    H: HashingStrategy<T>,
{
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        Extend::extend(&mut &self.map, iter.into_iter().map(|v| (v, ())))
    }
}

impl<T, H> FromIterator<T> for HashSet<T, H>
where
    T: 'static + Sync + Send + Clone,
    H: HashingStrategy<T> + Default,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            map: HashMap::from_iter(iter.into_iter().map(|v| (v, ()))),
        }
    }
}

impl<T, H> Clone for HashSet<T, H>
where
    T: 'static + Sync + Send + Clone,
    H: HashingStrategy<T> + Clone,
{
    fn clone(&self) -> HashSet<T, H> {
        Self {
            map: self.map.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CanonicalHashing, IdentityHashing, IntHashing};
    use std::sync::Arc;

    #[test]
    fn insert_contains_remove() {
        let set = HashSet::<i32, IntHashing>::new();
        let guard = set.guard();
        assert!(set.insert(3, &guard));
        assert!(!set.insert(3, &guard));
        assert!(set.contains(&3, &guard));
        assert_eq!(set.take(&3, &guard), Some(&3));
        assert!(!set.remove(&3, &guard));
        assert!(set.is_empty());
    }

    #[test]
    fn subsets() {
        let small: HashSet<i32, IntHashing> = (0..5).collect();
        let big: HashSet<i32, IntHashing> = (0..10).collect();
        let other: HashSet<i32, IntHashing> = (20..25).collect();
        let (g1, g2) = (small.guard(), big.guard());
        assert!(small.is_subset(&big, &g1, &g2));
        assert!(big.is_superset(&small, &g2, &g1));
        assert!(small.is_disjoint(&other, &g1, &other.guard()));
        assert!(!small.is_disjoint(&big, &g1, &g2));
        assert_eq!(small, small.clone());
    }

    #[test]
    fn identity_set_keeps_equal_values_apart() {
        let set = HashSet::<Arc<String>, IdentityHashing>::new();
        let guard = set.guard();
        let a = Arc::new(String::from("x"));
        let b = Arc::new(String::from("x"));
        assert!(set.insert(a.clone(), &guard));
        assert!(set.insert(b.clone(), &guard));
        assert!(!set.insert(a.clone(), &guard));
        assert_eq!(set.len(), 2);
        assert!(Arc::ptr_eq(set.get(&b, &guard).unwrap(), &b));
    }

    #[test]
    fn canonical_set_merges_equal_values() {
        let set = HashSet::<String, CanonicalHashing>::new();
        let guard = set.guard();
        assert!(set.insert(String::from("x"), &guard));
        assert!(!set.insert(String::from("x"), &guard));
        (&set).extend(vec![String::from("y"), String::from("z")]);
        set.retain(|s| s != "y", &guard);
        assert_eq!(set.len(), 2);
        assert_eq!(format!("{:?}", HashSet::<i32, IntHashing>::new()), "{}");
    }
}
