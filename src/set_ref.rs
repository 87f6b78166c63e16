use crate::iter::*;
use crate::strategy::HashingStrategy;
use crate::{GuardRef, HashSet};
use crossbeam_epoch::Guard;
use std::fmt::{self, Debug, Formatter};

/// A set handle that carries its own guard.
pub struct HashSetRef<'set, T, H = crate::DefaultHashing> {
    pub(crate) set: &'set HashSet<T, H>,
    guard: GuardRef<'set>,
}

impl<T, H> HashSet<T, H> {
    pub fn pin(&self) -> HashSetRef<'_, T, H> {
        HashSetRef {
            guard: GuardRef::Owned(self.guard()),
            set: self,
        }
    }

    pub fn with_guard<'g>(&'g self, guard: &'g Guard) -> HashSetRef<'g, T, H> {
        HashSetRef {
            set: self,
            guard: GuardRef::Ref(guard),
        }
    }
}

impl<T, H> HashSetRef<'_, T, H> {
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn iter(&self) -> Keys<'_, T, ()> {
        self.set.iter(&self.guard)
    }
}

impl<T, H> HashSetRef<'_, T, H>
where
    H: HashingStrategy<T>,
{
    #[inline]
    pub fn contains(&self, value: &T) -> bool {
        self.set.contains(value, &self.guard)
    }

    pub fn get<'g>(&'g self, value: &T) -> Option<&'g T> {
        self.set.get(value, &self.guard)
    }

    pub fn is_disjoint(&self, other: &HashSetRef<'_, T, H>) -> bool {
        self.set.is_disjoint(other.set, &self.guard, &other.guard)
    }

    pub fn is_subset(&self, other: &HashSetRef<'_, T, H>) -> bool {
        self.set.is_subset(other.set, &self.guard, &other.guard)
    }

    pub fn is_superset(&self, other: &HashSetRef<'_, T, H>) -> bool {
        self.set.is_superset(other.set, &self.guard, &other.guard)
    }
}

impl<T, H> HashSetRef<'_, T, H>
where
    T: 'static + Sync + Send + Clone,
    H: HashingStrategy<T>,
{
    pub fn insert(&self, value: T) -> bool {
        self.set.insert(value, &self.guard)
    }

    pub fn remove(&self, value: &T) -> bool {
        self.set.remove(value, &self.guard)
    }

    pub fn take<'g>(&'g self, value: &T) -> Option<&'g T> {
        self.set.take(value, &self.guard)
    }

    pub fn retain<F>(&self, f: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.set.retain(f, &self.guard);
    }

    pub fn clear(&self) {
        self.set.clear(&self.guard);
    }

    pub fn reserve(&self, additional: usize) {
        self.set.reserve(additional, &self.guard)
    }
}

impl<'g, T, H> IntoIterator for &'g HashSetRef<'_, T, H> {
    type IntoIter = Keys<'g, T, ()>;
    type Item = &'g T;

    fn into_iter(self) -> Self::IntoIter {
        self.set.iter(&self.guard)
    }
}

impl<T, H> Debug for HashSetRef<'_, T, H>
where
    T: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self).finish()
    }
}

impl<T, H> Clone for HashSetRef<'_, T, H> {
    fn clone(&self) -> Self {
        self.set.pin()
    }
}

impl<T, H> PartialEq for HashSetRef<'_, T, H>
where
    H: HashingStrategy<T>,
{
    fn eq(&self, other: &Self) -> bool {
        self.set.guarded_eq(other.set, &self.guard, &other.guard)
    }
}

impl<T, H> PartialEq<HashSet<T, H>> for HashSetRef<'_, T, H>
where
    H: HashingStrategy<T>,
{
    fn eq(&self, other: &HashSet<T, H>) -> bool {
        self.set.guarded_eq(other, &self.guard, &other.guard())
    }
}

impl<T, H> PartialEq<HashSetRef<'_, T, H>> for HashSet<T, H>
where
    H: HashingStrategy<T>,
{
    fn eq(&self, other: &HashSetRef<'_, T, H>) -> bool {
        self.guarded_eq(other.set, &self.guard(), &other.guard)
    }
}

impl<T, H> Eq for HashSetRef<'_, T, H> where H: HashingStrategy<T> {}

#[cfg(test)]
mod tests {
    use crate::{HashSet, IntHashing};

    #[test]
    fn pinned_set() {
        let set = HashSet::<u64, IntHashing>::new();
        let pinned = set.pin();
        assert!(pinned.insert(1));
        assert!(pinned.insert(2));
        assert!(pinned.contains(&1));
        assert!(pinned.remove(&1));
        assert_eq!(pinned.iter().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(pinned, set);
        assert_eq!(format!("{:?}", pinned), "{2}");
    }
}
