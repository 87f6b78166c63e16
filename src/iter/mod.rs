mod traverser;
pub(crate) use traverser::NodeIter;

use crossbeam_epoch::Guard;
use std::sync::atomic::Ordering;

/// Iterator over the entries of a map, see [`HashMap::iter`](crate::HashMap::iter).
#[derive(Debug)]
pub struct Iter<'g, K, V> {
    pub(crate) node_iter: NodeIter<'g, K, V>,
    pub(crate) guard: &'g Guard,
}

impl<'g, K, V> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);
    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.node_iter.next()?;
        let value = value.load(Ordering::SeqCst, self.guard);
        let value = unsafe { value.deref() };
        Some((key, value))
    }
}

/// Iterator over the keys of a map.
#[derive(Debug)]
pub struct Keys<'g, K, V> {
    pub(crate) node_iter: NodeIter<'g, K, V>,
}

impl<'g, K, V> Iterator for Keys<'g, K, V> {
    type Item = &'g K;
    fn next(&mut self) -> Option<Self::Item> {
        let (key, _) = self.node_iter.next()?;
        Some(key)
    }
}

/// Iterator over the values of a map.
#[derive(Debug)]
pub struct Values<'g, K, V> {
    pub(crate) node_iter: NodeIter<'g, K, V>,
    pub(crate) guard: &'g Guard,
}

impl<'g, K, V> Iterator for Values<'g, K, V> {
    type Item = &'g V;
    fn next(&mut self) -> Option<Self::Item> {
        let (_, value) = self.node_iter.next()?;
        let value = value.load(Ordering::SeqCst, self.guard);
        let value = unsafe { value.deref() };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use crate::ConcurrentIntObjectMap;
    use std::collections::HashSet;
    use std::iter::FromIterator;

    #[test]
    fn iter() {
        let map = ConcurrentIntObjectMap::<usize>::new();

        let guard = map.guard();
        map.insert(1, 42, &guard);
        map.insert(2, 84, &guard);

        let guard = map.guard();
        assert_eq!(
            map.iter(&guard).collect::<HashSet<(&i32, &usize)>>(),
            HashSet::from_iter(vec![(&1, &42), (&2, &84)])
        );
    }

    #[test]
    fn keys() {
        let map = ConcurrentIntObjectMap::<usize>::new();

        let guard = map.guard();
        map.insert(1, 42, &guard);
        map.insert(2, 84, &guard);

        let guard = map.guard();
        assert_eq!(
            map.keys(&guard).collect::<HashSet<&i32>>(),
            HashSet::from_iter(vec![&1, &2])
        );
    }

    #[test]
    fn values() {
        let map = ConcurrentIntObjectMap::<usize>::new();

        let guard = map.guard();
        map.insert(1, 42, &guard);
        map.insert(2, 84, &guard);

        let guard = map.guard();
        assert_eq!(
            map.values(&guard).collect::<HashSet<&usize>>(),
            HashSet::from_iter(vec![&42, &84])
        );
    }

    #[test]
    fn removal_during_iteration_is_tolerated() {
        let map: ConcurrentIntObjectMap<i32> = (0..200).map(|i| (i, i)).collect();
        let guard = map.guard();
        let mut seen = 0;
        for (k, v) in map.iter(&guard) {
            assert_eq!(k, v);
            map.remove(k, &guard);
            seen += 1;
        }
        assert_eq!(seen, 200);
        assert!(map.is_empty());
    }
}
