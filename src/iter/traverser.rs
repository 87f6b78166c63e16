use crate::node::{Arena, BinEntry, EntryRef, Node, NIL};
use crate::raw::Table;
use crossbeam_epoch::{Guard, Shared};
use std::sync::atomic::Ordering;

/// Where the traversal stands inside the current bin.
#[derive(Debug)]
enum Cursor<'g, K, V> {
    Chain(&'g Node<K, V>),
    Tree(&'g Arena<K, V>, u32),
}

impl<K, V> Clone for Cursor<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for Cursor<'_, K, V> {}

/// Walks every entry of a table, following forwarding markers into the
/// tables of an ongoing resize.
///
/// Each entry present for the whole traversal is returned exactly once;
/// entries added or removed concurrently may or may not show up.
#[derive(Debug)]
pub(crate) struct NodeIter<'g, K, V> {
    table: Option<&'g Table<K, V>>,

    stack: Option<Box<TableStack<'g, K, V>>>,
    spare: Option<Box<TableStack<'g, K, V>>>,

    prev: Option<Cursor<'g, K, V>>,

    index: usize,

    base_index: usize,

    base_limit: usize,

    base_size: usize,

    guard: &'g Guard,
}

impl<'g, K, V> NodeIter<'g, K, V> {
    pub(crate) fn new(table: Shared<'g, Table<K, V>>, guard: &'g Guard) -> Self {
        let (table, len) = match unsafe { table.as_ref() } {
            None => (None, 0),
            Some(table) => (Some(table), table.len()),
        };

        Self {
            table,
            stack: None,
            spare: None,
            prev: None,
            base_size: len,
            base_index: 0,
            index: 0,
            base_limit: len,
            guard,
        }
    }

    fn push_state(&mut self, t: &'g Table<K, V>, i: usize, n: usize) {
        let mut s = self.spare.take();
        if let Some(ref mut s) = s {
            self.spare = s.next.take();
        }

        let target = TableStack {
            table: t,
            length: n,
            index: i,
            next: self.stack.take(),
        };

        self.stack = if let Some(mut s) = s {
            *s = target;
            Some(s)
        } else {
            Some(Box::new(target))
        };
    }

    fn recover_state(&mut self, mut n: usize) {
        while let Some(mut s) = self.stack.take() {
            if self.index + s.length < n {
                self.index += s.length;
                self.stack = Some(s);
                break;
            }

            n = s.length;
            self.index = s.index;
            self.table = Some(s.table);
            self.stack = s.next.take();

            s.next = self.spare.take();
            self.spare = Some(s);
        }

        if self.stack.is_none() {
            self.index += self.base_size;
            if self.index >= n {
                self.base_index += 1;
                self.index = self.base_index;
            }
        }
    }

    /// The entry after `cursor` in the same bin.
    fn successor(&self, cursor: Cursor<'g, K, V>) -> Option<Cursor<'g, K, V>> {
        match cursor {
            Cursor::Chain(node) => {
                let next = node.next.load(Ordering::SeqCst, self.guard);
                match unsafe { next.as_ref() }? {
                    BinEntry::Node(node) => Some(Cursor::Chain(node)),
                    _ => unreachable!("chain nodes only point to chain nodes"),
                }
            }
            Cursor::Tree(arena, i) => match arena.next_of(i) {
                NIL => None,
                next => Some(Cursor::Tree(arena, next)),
            },
        }
    }

    fn entry(cursor: Cursor<'g, K, V>) -> EntryRef<'g, K, V> {
        match cursor {
            Cursor::Chain(node) => (&node.key, &node.value),
            Cursor::Tree(arena, i) => match arena.get(i) {
                Some(node) => (&node.key, &node.value),
                None => unreachable!("tree cursor points at a node"),
            },
        }
    }
}

impl<'g, K, V> Iterator for NodeIter<'g, K, V> {
    type Item = EntryRef<'g, K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut e = self.prev.and_then(|prev| self.successor(prev));

        loop {
            if let Some(cursor) = e {
                self.prev = e;
                return Some(Self::entry(cursor));
            }

            let t = match self.table {
                Some(t) if self.base_index < self.base_limit && self.index < t.len() => t,
                _ => {
                    self.prev = None;
                    return None;
                }
            };

            let i = self.index;
            let n = t.len();
            let bin = t.bin(i, self.guard);
            if let Some(bin) = unsafe { bin.as_ref() } {
                match bin {
                    BinEntry::Moved => {
                        self.table = unsafe { t.next_table(self.guard).as_ref() };
                        self.prev = None;
                        self.push_state(t, i, n);
                        continue;
                    }
                    BinEntry::Node(node) => {
                        e = Some(Cursor::Chain(node));
                    }
                    BinEntry::Tree(tree_bin) => {
                        let arena = tree_bin.arena(self.guard);
                        let first = arena.first();
                        if first != NIL {
                            e = Some(Cursor::Tree(arena, first));
                        }
                    }
                    // nothing is visible until the computation finishes
                    BinEntry::Reserved(_) => {}
                }
            }

            if self.stack.is_some() {
                self.recover_state(n);
            } else {
                self.index = i + self.base_size;
                if self.index >= n {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
            }
        }
    }
}

#[derive(Debug)]
struct TableStack<'g, K, V> {
    length: usize,
    index: usize,
    table: &'g Table<K, V>,
    next: Option<Box<TableStack<'g, K, V>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::IntHashing;
    use crossbeam_epoch::{self as epoch, Atomic, Owned};

    #[test]
    fn iter_new() {
        let guard = epoch::pin();
        let iter = NodeIter::<usize, usize>::new(Shared::null(), &guard);
        assert_eq!(iter.count(), 0);
    }

    #[test]
    fn iter_empty() {
        let table = Owned::new(Table::<usize, usize>::new(16));
        let guard = epoch::pin();
        let table = table.into_shared(&guard);
        let iter = NodeIter::new(table, &guard);
        assert_eq!(iter.count(), 0);

        // safety: nothing else saw the table
        drop(unsafe { table.into_owned() });
    }

    #[test]
    fn iter_chain_and_tree() {
        let guard = epoch::pin();
        let table = Owned::new(Table::<usize, usize>::new(4)).into_shared(&guard);
        let t = unsafe { table.deref() };

        let tail = Owned::new(BinEntry::Node(Node::new(4, 4, Owned::new(40))));
        t.store_bin(
            0,
            Owned::new(BinEntry::Node(Node::with_next(
                0,
                0,
                Owned::new(0),
                Atomic::from(tail),
            ))),
        );
        let tree_nodes = (0..10)
            .map(|i| crate::node::TreeNode::new(1, 10 + i, Owned::new(i)))
            .collect();
        t.store_bin(
            1,
            Owned::new(BinEntry::Tree(crate::node::TreeBin::new(tree_nodes, &IntHashing))),
        );

        let mut keys: Vec<_> = NodeIter::new(table, &guard).map(|(k, _)| *k).collect();
        keys.sort_unstable();
        let mut expected = vec![0, 4];
        expected.extend(10..20);
        assert_eq!(keys, expected);

        unsafe {
            let mut table = table.into_owned();
            table.drop_bins();
        }
    }

    #[test]
    fn iter_follows_forwarding() {
        let guard = epoch::pin();
        let old = Owned::new(Table::<usize, usize>::new(2)).into_shared(&guard);
        let new = Owned::new(Table::<usize, usize>::new(4)).into_shared(&guard);
        let (old_ref, new_ref) = unsafe { (old.deref(), new.deref()) };

        old_ref.store_bin(0, Owned::new(BinEntry::Node(Node::new(0, 0, Owned::new(0)))));
        new_ref.store_bin(1, Owned::new(BinEntry::Node(Node::new(1, 1, Owned::new(1)))));
        new_ref.store_bin(3, Owned::new(BinEntry::Node(Node::new(3, 3, Owned::new(3)))));
        old_ref.store_bin(1, old_ref.get_moved(new, &guard));

        let mut keys: Vec<_> = NodeIter::new(old, &guard).map(|(k, _)| *k).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![0, 1, 3]);

        unsafe {
            let mut old = old.into_owned();
            old.drop_bins();
            let mut new = new.into_owned();
            new.drop_bins();
        }
    }
}
