use crate::node::*;
use crate::strategy::HashingStrategy;
use crossbeam_epoch::{Atomic, CompareExchangeError, Guard, Pointer, Shared};
use std::sync::atomic::Ordering;

/// One generation of bins.
///
/// While a resize copies bins out of a table, `next_table` points at the
/// table they are copied into and every copied bin holds `moved`.
#[derive(Debug)]
pub(crate) struct Table<K, V> {
    bins: Box<[Atomic<BinEntry<K, V>>]>,
    moved: Atomic<BinEntry<K, V>>,
    next_table: Atomic<Table<K, V>>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(bins: usize) -> Self {
        Table {
            bins: (0..bins).map(|_| Atomic::null()).collect(),
            moved: Atomic::new(BinEntry::Moved),
            next_table: Atomic::null(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub(crate) fn bini(&self, hash: u64) -> usize {
        (hash & (self.bins.len() as u64 - 1)) as usize
    }

    #[inline]
    pub(crate) fn bin<'g>(&'g self, i: usize, guard: &'g Guard) -> Shared<'g, BinEntry<K, V>> {
        self.bins[i].load(Ordering::Acquire, guard)
    }

    #[inline]
    #[allow(clippy::type_complexity)]
    pub(crate) fn cas_bin<'g, P>(
        &'g self,
        i: usize,
        current: Shared<'_, BinEntry<K, V>>,
        new: P,
        guard: &'g Guard,
    ) -> Result<Shared<'g, BinEntry<K, V>>, CompareExchangeError<'g, BinEntry<K, V>, P>>
    where
        P: Pointer<BinEntry<K, V>>,
    {
        self.bins[i].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    #[inline]
    pub(crate) fn store_bin<P: Pointer<BinEntry<K, V>>>(&self, i: usize, new: P) {
        self.bins[i].store(new, Ordering::Release)
    }

    #[inline]
    pub(crate) fn next_table<'g>(&'g self, guard: &'g Guard) -> Shared<'g, Table<K, V>> {
        self.next_table.load(Ordering::SeqCst, guard)
    }

    /// The forwarding marker of this table. The first call links the table
    /// to `successor`; later calls must name the same successor.
    pub(crate) fn get_moved<'g>(
        &'g self,
        successor: Shared<'g, Table<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        let linked = match self.next_table.compare_exchange(
            Shared::null(),
            successor,
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        ) {
            Ok(_) => successor,
            Err(e) => e.current,
        };
        assert_eq!(linked, successor, "table forwarded to two successors");
        self.moved.load(Ordering::SeqCst, guard)
    }

    /// Looks `key` up in `bin`, which belongs to this table. A forwarded bin
    /// is looked up again in the successor tables.
    pub(crate) fn find<'g, H>(
        &'g self,
        bin: &'g BinEntry<K, V>,
        hash: u64,
        key: &K,
        strategy: &H,
        guard: &'g Guard,
    ) -> Option<EntryRef<'g, K, V>>
    where
        H: HashingStrategy<K>,
    {
        let mut table = self;
        let mut bin = bin;
        loop {
            match *bin {
                BinEntry::Node(ref head) => {
                    return head
                        .find(hash, key, strategy, guard)
                        .map(|n| (&n.key, &n.value))
                }
                BinEntry::Tree(ref tree_bin) => {
                    return tree_bin
                        .find(hash, key, strategy, guard)
                        .map(|n| (&n.key, &n.value))
                }
                BinEntry::Reserved(_) => return None,
                BinEntry::Moved => {
                    table = unsafe { table.next_table(guard).deref() };
                    if table.is_empty() {
                        return None;
                    }
                    bin = unsafe { table.bin(table.bini(hash), guard).as_ref() }?;
                }
            }
        }
    }

    /// Frees every bin together with the values it holds.
    ///
    /// Only for a table no other thread can reach any more.
    pub(crate) fn drop_bins(&mut self) {
        let guard = unsafe { crossbeam_epoch::unprotected() };

        for bin in std::mem::take(&mut self.bins).into_vec() {
            let head = bin.load(Ordering::Relaxed, guard);
            match unsafe { head.as_ref() } {
                None | Some(BinEntry::Moved) => {}
                Some(BinEntry::Node(_)) => {
                    let mut next = Some(unsafe { bin.into_owned() });
                    while let Some(entry) = next.take() {
                        if let BinEntry::Node(node) = *entry.into_box() {
                            drop(unsafe { node.value.into_owned() });
                            if !node.next.load(Ordering::Relaxed, guard).is_null() {
                                next = Some(unsafe { node.next.into_owned() });
                            }
                        }
                    }
                }
                // tree bins free their values on drop, reservations hold none
                Some(BinEntry::Tree(_)) | Some(BinEntry::Reserved(_)) => {
                    drop(unsafe { bin.into_owned() });
                }
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        let guard = unsafe { crossbeam_epoch::unprotected() };

        if cfg!(debug_assertions) {
            for bin in self.bins.iter() {
                let bin = bin.load(Ordering::Relaxed, guard);
                if let Some(entry) = unsafe { bin.as_ref() } {
                    assert!(
                        matches!(entry, BinEntry::Moved),
                        "table dropped while a bin still holds entries"
                    );
                }
            }
        }

        let moved = self.moved.swap(Shared::null(), Ordering::Relaxed, guard);
        if !moved.is_null() {
            drop(unsafe { moved.into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::IntHashing;
    use crossbeam_epoch::Owned;

    #[test]
    fn find_follows_forwarding() {
        let guard = crossbeam_epoch::pin();
        let old = Owned::new(Table::<i32, i32>::new(2)).into_shared(&guard);
        let new = Owned::new(Table::<i32, i32>::new(4)).into_shared(&guard);
        let (old_ref, new_ref) = unsafe { (old.deref(), new.deref()) };

        new_ref.store_bin(3, Owned::new(BinEntry::Node(Node::new(3, 3, Owned::new(30)))));
        let moved = old_ref.get_moved(new, &guard);
        old_ref.store_bin(1, moved);

        let bin = unsafe { old_ref.bin(1, &guard).deref() };
        let (key, value) = old_ref
            .find(bin, 3, &3, &IntHashing, &guard)
            .expect("forwarded");
        assert_eq!(*key, 3);
        assert_eq!(unsafe { *value.load(Ordering::SeqCst, &guard).deref() }, 30);
        assert!(old_ref.find(bin, 7, &7, &IntHashing, &guard).is_none());

        unsafe {
            let mut new = new.into_owned();
            new.drop_bins();
            drop(new);
            drop(old.into_owned());
        }
    }

    #[test]
    fn reserved_bins_hold_nothing() {
        let guard = crossbeam_epoch::pin();
        let table = Table::<i32, i32>::new(2);
        let reserved = BinEntry::Reserved(ReservationNode::new());
        assert!(table.find(&reserved, 0, &0, &IntHashing, &guard).is_none());
    }
}
