use crate::raw::Table;
use crate::strategy::HashingStrategy;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use log::trace;
use parking_lot::Mutex;
use std::cmp::Ordering as Order;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::OnceLock;
use std::thread::{current, park, Thread, ThreadId};

/// A key together with the slot holding its value.
pub(crate) type EntryRef<'g, K, V> = (&'g K, &'g Atomic<V>);

/// The entries of a table's bins.
#[derive(Debug)]
pub(crate) enum BinEntry<K, V> {
    /// Head of a linked chain.
    Node(Node<K, V>),
    /// Red-black tree holding the bin's entries.
    Tree(TreeBin<K, V>),
    /// The bin has been copied to the next table.
    Moved,
    /// A value for this bin is being computed.
    Reserved(ReservationNode),
}

unsafe impl<K, V> Send for BinEntry<K, V>
where
    K: Send,
    V: Send,
    Node<K, V>: Send,
    Table<K, V>: Send,
{
}

unsafe impl<K, V> Sync for BinEntry<K, V>
where
    K: Sync,
    V: Sync,
    Node<K, V>: Sync,
    Table<K, V>: Sync,
{
}

impl<K, V> BinEntry<K, V> {
    pub(crate) fn as_node(&self) -> Option<&Node<K, V>> {
        if let BinEntry::Node(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }
}

/// Key-value entry of a chain.
#[derive(Debug)]
pub(crate) struct Node<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BinEntry<K, V>>,
    pub(crate) lock: Mutex<()>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new<AV>(hash: u64, key: K, value: AV) -> Self
    where
        AV: Into<Atomic<V>>,
    {
        Node::with_next(hash, key, value, Atomic::null())
    }

    pub(crate) fn with_next<AV>(hash: u64, key: K, value: AV, next: Atomic<BinEntry<K, V>>) -> Self
    where
        AV: Into<Atomic<V>>,
    {
        Node {
            hash,
            key,
            value: value.into(),
            next,
            lock: Mutex::new(()),
        }
    }

    /// Walks the chain starting at `self`.
    pub(crate) fn find<'g, H>(
        &'g self,
        hash: u64,
        key: &K,
        strategy: &H,
        guard: &'g Guard,
    ) -> Option<&'g Node<K, V>>
    where
        H: HashingStrategy<K>,
    {
        let mut node = self;
        loop {
            if node.hash == hash && strategy.equals(&node.key, key) {
                return Some(node);
            }
            let next = node.next.load(Ordering::SeqCst, guard);
            node = unsafe { next.as_ref() }?.as_node()?;
        }
    }
}

/// Placeholder that keeps a bin locked while `compute_if_absent` runs.
#[derive(Debug)]
pub(crate) struct ReservationNode {
    pub(crate) lock: Mutex<()>,
    pub(crate) owner: ThreadId,
}

impl ReservationNode {
    pub(crate) fn new() -> Self {
        ReservationNode {
            lock: Mutex::new(()),
            owner: current().id(),
        }
    }
}

/* ------------------------ TreeNodes ------------------------ */

/// Index of "no node" in an [`Arena`].
pub(crate) const NIL: u32 = u32::MAX;

/// Smallest arena allocated for a tree bin.
const MIN_ARENA_CAPACITY: usize = 16;

/// A tree bin with this many entries or fewer is turned back into a chain.
pub(crate) const UNTREEIFY_THRESHOLD: usize = 6;

#[derive(Debug)]
pub(crate) struct TreeNode<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,

    parent: AtomicU32,
    left: AtomicU32,
    right: AtomicU32,
    prev: AtomicU32, // needed to unlink `next` upon deletion
    next: AtomicU32,
    red: AtomicBool,
}

impl<K, V> TreeNode<K, V> {
    pub(crate) fn new<AV>(hash: u64, key: K, value: AV) -> Self
    where
        AV: Into<Atomic<V>>,
    {
        TreeNode {
            hash,
            key,
            value: value.into(),
            parent: AtomicU32::new(NIL),
            left: AtomicU32::new(NIL),
            right: AtomicU32::new(NIL),
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
            red: AtomicBool::new(false),
        }
    }

    #[inline]
    fn order<H: HashingStrategy<K>>(&self, hash: u64, key: &K, strategy: &H) -> Order {
        self.hash
            .cmp(&hash)
            .then_with(|| strategy.compare(&self.key, key))
    }
}

/// Storage of one tree bin's nodes.
///
/// Nodes are addressed by their slot index. A slot is written once and never
/// reused, so a reader holding an index can always dereference it; removed
/// nodes stay in place, unlinked, until the whole arena is retired. Only the
/// writer holding the bin lock appends to an arena.
#[derive(Debug)]
pub(crate) struct Arena<K, V> {
    slots: Box<[OnceLock<TreeNode<K, V>>]>,
    len: AtomicU32,
    root: AtomicU32,
    first: AtomicU32,
    live: AtomicU32,
}

impl<K, V> Arena<K, V> {
    /// Builds a balanced tree over `nodes`, keeping their order in the
    /// `next` list.
    fn build<H>(nodes: Vec<TreeNode<K, V>>, strategy: &H) -> Self
    where
        H: HashingStrategy<K>,
    {
        let len = nodes.len();
        let capacity = (len * 2).max(MIN_ARENA_CAPACITY).next_power_of_two();
        let slots: Box<[OnceLock<TreeNode<K, V>>]> = nodes
            .into_iter()
            .map(OnceLock::from)
            .chain(std::iter::repeat_with(OnceLock::new).take(capacity - len))
            .collect();
        let arena = Arena {
            slots,
            len: AtomicU32::new(len as u32),
            root: AtomicU32::new(NIL),
            first: AtomicU32::new(if len == 0 { NIL } else { 0 }),
            live: AtomicU32::new(len as u32),
        };

        let mut root = NIL;
        for x in 0..len as u32 {
            let x_node = arena.node(x);
            if x > 0 {
                x_node.prev.store(x - 1, Ordering::Relaxed);
            }
            if x as usize + 1 < len {
                x_node.next.store(x + 1, Ordering::Relaxed);
            }

            if root == NIL {
                root = x;
                continue;
            }

            // descend from the root to find where x belongs
            let mut p = root;
            loop {
                let p_node = arena.node(p);
                let left = match p_node.order(x_node.hash, &x_node.key, strategy) {
                    Order::Greater => true,
                    Order::Less => false,
                    Order::Equal => unreachable!("one key references two nodes"),
                };
                let child = if left { arena.left(p) } else { arena.right(p) };
                if child == NIL {
                    arena.set_parent(x, p);
                    if left {
                        arena.set_left(p, x);
                    } else {
                        arena.set_right(p, x);
                    }
                    root = arena.balance_insertion(root, x);
                    break;
                }
                p = child;
            }
        }
        arena.root.store(root, Ordering::Release);

        if cfg!(debug_assertions) && root != NIL {
            arena.check_invariants(root);
        }
        arena
    }

    #[inline]
    pub(crate) fn get(&self, i: u32) -> Option<&TreeNode<K, V>> {
        self.slots.get(i as usize)?.get()
    }

    #[inline]
    fn node(&self, i: u32) -> &TreeNode<K, V> {
        match self.get(i) {
            Some(node) => node,
            None => unreachable!("tree index {} does not name a node", i),
        }
    }

    /// Number of entries still linked into the tree.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire) as usize
    }

    /// The first node of the `next` list, or `NIL`.
    pub(crate) fn first(&self) -> u32 {
        self.first.load(Ordering::Acquire)
    }

    /// The node following `i` in the `next` list, or `NIL`.
    pub(crate) fn next_of(&self, i: u32) -> u32 {
        self.node(i).next.load(Ordering::Acquire)
    }

    /// Live nodes in list order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &TreeNode<K, V>> + '_ {
        let mut e = self.first();
        std::iter::from_fn(move || {
            let node = self.get(e)?;
            e = node.next.load(Ordering::Acquire);
            Some(node)
        })
    }

    /// Appends a node, or hands it back if the arena is full.
    fn push(&self, node: TreeNode<K, V>) -> Result<u32, TreeNode<K, V>> {
        let i = self.len.load(Ordering::Relaxed);
        let slot = match self.slots.get(i as usize) {
            Some(slot) => slot,
            None => return Err(node),
        };
        slot.set(node)?;
        self.len.store(i + 1, Ordering::Release);
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(i)
    }

    fn find_index<H>(&self, hash: u64, key: &K, strategy: &H) -> u32
    where
        H: HashingStrategy<K>,
    {
        let mut p = self.root.load(Ordering::Acquire);
        while let Some(node) = self.get(p) {
            p = match node.order(hash, key, strategy) {
                Order::Greater => node.left.load(Ordering::Acquire),
                Order::Less => node.right.load(Ordering::Acquire),
                Order::Equal => return p,
            };
        }
        NIL
    }

    #[inline]
    fn parent(&self, i: u32) -> u32 {
        self.node(i).parent.load(Ordering::Relaxed)
    }

    #[inline]
    fn left(&self, i: u32) -> u32 {
        self.node(i).left.load(Ordering::Relaxed)
    }

    #[inline]
    fn right(&self, i: u32) -> u32 {
        self.node(i).right.load(Ordering::Relaxed)
    }

    /// Colour of `i`; the missing leaves are black.
    #[inline]
    fn is_red(&self, i: u32) -> bool {
        self.get(i).map_or(false, |n| n.red.load(Ordering::Relaxed))
    }

    #[inline]
    fn set_parent(&self, i: u32, p: u32) {
        self.node(i).parent.store(p, Ordering::Release);
    }

    #[inline]
    fn set_left(&self, i: u32, l: u32) {
        self.node(i).left.store(l, Ordering::Release);
    }

    #[inline]
    fn set_right(&self, i: u32, r: u32) {
        self.node(i).right.store(r, Ordering::Release);
    }

    #[inline]
    fn set_red(&self, i: u32, red: bool) {
        if let Some(n) = self.get(i) {
            n.red.store(red, Ordering::Relaxed);
        }
    }
}

const WRITER: i64 = 1; // set while holding write lock
const WAITER: i64 = 2; // set when waiting for write lock
const READER: i64 = 4; // increment value for setting read lock

/// Head of a bin whose entries are kept in a red-black tree.
///
/// Writers hold `lock` for every change. Restructuring the tree additionally
/// takes the read-write `lock_state`, so readers walking the tree see either
/// the old or the new shape; while a writer holds or waits for it, readers
/// fall back to walking the `next` list.
#[derive(Debug)]
pub(crate) struct TreeBin<K, V> {
    arena: Atomic<Arena<K, V>>,
    waiter: Atomic<Thread>,
    pub(crate) lock: Mutex<()>,
    lock_state: AtomicI64,
}

impl<K, V> TreeBin<K, V> {
    pub(crate) fn new<H>(nodes: Vec<TreeNode<K, V>>, strategy: &H) -> Self
    where
        H: HashingStrategy<K>,
    {
        TreeBin {
            arena: Atomic::new(Arena::build(nodes, strategy)),
            waiter: Atomic::null(),
            lock: Mutex::new(()),
            lock_state: AtomicI64::new(0),
        }
    }

    /// The arena currently published for this bin.
    pub(crate) fn arena<'g>(&'g self, guard: &'g Guard) -> &'g Arena<K, V> {
        // safety: the arena is only replaced while the bin lock is held, and
        // the replaced arena is retired through the epoch collector, so it
        // outlives the guard it was loaded under. It is only null once the
        // bin itself is being dropped.
        unsafe { self.arena.load(Ordering::Acquire, guard).deref() }
    }

    fn lock_root(&self, guard: &Guard) {
        if self
            .lock_state
            .compare_exchange(0, WRITER, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            self.contended_lock(guard);
        }
    }

    fn unlock_root(&self) {
        self.lock_state.store(0, Ordering::Release);
    }

    fn contended_lock(&self, guard: &Guard) {
        let mut waiting = false;
        loop {
            let state = self.lock_state.load(Ordering::Acquire);
            if state & !WAITER == 0 {
                // there are no writing or reading threads
                if self
                    .lock_state
                    .compare_exchange(state, WRITER, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    if waiting {
                        let waiter = self.waiter.swap(Shared::null(), Ordering::SeqCst, guard);
                        unsafe { guard.defer_destroy(waiter) };
                    }
                    return;
                }
            } else if state & WAITER == 0 {
                if self
                    .lock_state
                    .compare_exchange(state, state | WAITER, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    waiting = true;
                    let waiter = self
                        .waiter
                        .swap(Owned::new(current()), Ordering::SeqCst, guard);
                    assert!(waiter.is_null());
                }
            } else if waiting {
                park();
            }
            std::hint::spin_loop();
        }
    }

    /// Looks up `key` without taking the bin lock.
    pub(crate) fn find<'g, H>(
        &'g self,
        hash: u64,
        key: &K,
        strategy: &H,
        guard: &'g Guard,
    ) -> Option<&'g TreeNode<K, V>>
    where
        H: HashingStrategy<K>,
    {
        let arena = self.arena(guard);
        let mut e = arena.first();
        while let Some(element) = arena.get(e) {
            let s = self.lock_state.load(Ordering::SeqCst);
            if s & (WAITER | WRITER) != 0 {
                if element.hash == hash && strategy.equals(&element.key, key) {
                    return Some(element);
                }
                e = element.next.load(Ordering::SeqCst);
            } else if self
                .lock_state
                .compare_exchange(s, s + READER, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // the arena may have been rebuilt before we got the read lock
                let arena = self.arena(guard);
                let p = arena.get(arena.find_index(hash, key, strategy));
                if self.lock_state.fetch_add(-READER, Ordering::SeqCst) == (READER | WAITER) {
                    // we were the last reader holding up a waiting writer
                    let waiter = self.waiter.load(Ordering::SeqCst, guard);
                    if let Some(waiter) = unsafe { waiter.as_ref() } {
                        // safety: the waiter only drops its handle after it
                        // acquires the write lock, which we are holding up
                        waiter.unpark();
                    }
                }
                return p;
            }
        }
        None
    }

    /// Finds the node of `key` or links a new one holding `value`.
    ///
    /// Returns the existing node if there was one, in which case `value` is
    /// untouched. The bin lock must be held.
    pub(crate) fn find_or_put_tree_val<'g, H>(
        &'g self,
        hash: u64,
        key: K,
        value: Shared<'g, V>,
        strategy: &H,
        guard: &'g Guard,
    ) -> Option<&'g TreeNode<K, V>>
    where
        K: Clone,
        H: HashingStrategy<K>,
    {
        let mut x_node = TreeNode::new(hash, key, value);
        loop {
            let arena = self.arena(guard);
            let root = arena.root.load(Ordering::Acquire);

            // find the parent of the new leaf and the side it hangs off
            let mut parent = NIL;
            let mut left = false;
            let mut p = root;
            while let Some(p_node) = arena.get(p) {
                parent = p;
                p = match p_node.order(hash, &x_node.key, strategy) {
                    Order::Equal => return Some(p_node),
                    Order::Greater => {
                        left = true;
                        p_node.left.load(Ordering::Relaxed)
                    }
                    Order::Less => {
                        left = false;
                        p_node.right.load(Ordering::Relaxed)
                    }
                };
            }

            let first = arena.first();
            *x_node.parent.get_mut() = parent;
            *x_node.next.get_mut() = first;
            // a fresh leaf is red unless it becomes the root
            *x_node.red.get_mut() = parent != NIL;
            let x = match arena.push(x_node) {
                Ok(x) => x,
                Err(back) => {
                    x_node = back;
                    self.grow(arena, strategy, guard);
                    continue;
                }
            };

            if first != NIL {
                arena.node(first).prev.store(x, Ordering::Release);
            }
            arena.first.store(x, Ordering::Release);

            if parent == NIL {
                arena.root.store(x, Ordering::Release);
            } else {
                if left {
                    arena.set_left(parent, x);
                } else {
                    arena.set_right(parent, x);
                }
                if arena.is_red(parent) {
                    self.lock_root(guard);
                    let root = arena.balance_insertion(arena.root.load(Ordering::Relaxed), x);
                    arena.root.store(root, Ordering::Release);
                    self.unlock_root();
                }
            }

            if cfg!(debug_assertions) {
                arena.check_invariants(arena.root.load(Ordering::Acquire));
            }
            return None;
        }
    }

    /// Finds the node of `key` while the bin lock is held, returning its
    /// index in the current arena.
    pub(crate) fn find_locked<'g, H>(
        &'g self,
        hash: u64,
        key: &K,
        strategy: &H,
        guard: &'g Guard,
    ) -> Option<(u32, &'g TreeNode<K, V>)>
    where
        H: HashingStrategy<K>,
    {
        let arena = self.arena(guard);
        let i = arena.find_index(hash, key, strategy);
        arena.get(i).map(|node| (i, node))
    }

    /// Replaces a full arena by a larger one holding the same entries.
    fn grow<H>(&self, arena: &Arena<K, V>, strategy: &H, guard: &Guard)
    where
        K: Clone,
        H: HashingStrategy<K>,
    {
        let nodes: Vec<_> = arena
            .iter()
            .map(|n| {
                TreeNode::new(
                    n.hash,
                    n.key.clone(),
                    n.value.load(Ordering::Acquire, guard),
                )
            })
            .collect();
        let rebuilt = Owned::new(Arena::build(nodes, strategy));
        let capacity = rebuilt.slots.len();
        let old = self.arena.swap(rebuilt, Ordering::AcqRel, guard);
        // the values moved to the new arena; dropping the old one only drops keys
        unsafe { guard.defer_destroy(old) };
        trace!("tree bin arena rebuilt with {} slots", capacity);
    }

    /// Unlinks node `p` of the current arena.
    ///
    /// Returns `true` if the bin is now small enough to be turned back into a
    /// chain; the tree links are then left as they are, since the caller
    /// replaces the whole bin. The bin lock must be held. The node's value is
    /// left for the caller to retire.
    pub(crate) fn remove_tree_node(&self, p: u32, guard: &Guard) -> bool {
        let arena = self.arena(guard);
        let p_node = arena.node(p);
        let next = p_node.next.load(Ordering::Acquire);
        let prev = p_node.prev.load(Ordering::Acquire);

        if prev == NIL {
            arena.first.store(next, Ordering::Release);
        } else {
            arena.node(prev).next.store(next, Ordering::Release);
        }
        if next != NIL {
            arena.node(next).prev.store(prev, Ordering::Release);
        }
        let live = arena.live.fetch_sub(1, Ordering::AcqRel) - 1;

        if arena.first() == NIL || live as usize <= UNTREEIFY_THRESHOLD {
            return true;
        }

        self.lock_root(guard);
        let mut root = arena.root.load(Ordering::Relaxed);

        let replacement;
        let p_left = arena.left(p);
        let p_right = arena.right(p);
        if p_left != NIL && p_right != NIL {
            // find the smallest successor of `p`
            let mut successor = p_right;
            loop {
                let l = arena.left(successor);
                if l == NIL {
                    break;
                }
                successor = l;
            }
            // swap colors
            let color = arena.is_red(successor);
            arena.set_red(successor, arena.is_red(p));
            arena.set_red(p, color);

            let successor_right = arena.right(successor);
            let p_parent = arena.parent(p);
            if successor == p_right {
                // `p` was the direct parent of the smallest successor
                arena.set_parent(p, successor);
                arena.set_right(successor, p);
            } else {
                let successor_parent = arena.parent(successor);
                arena.set_parent(p, successor_parent);
                if successor_parent != NIL {
                    if successor == arena.left(successor_parent) {
                        arena.set_left(successor_parent, p);
                    } else {
                        arena.set_right(successor_parent, p);
                    }
                }
                arena.set_right(successor, p_right);
                arena.set_parent(p_right, successor);
            }
            arena.set_left(p, NIL);
            arena.set_right(p, successor_right);
            if successor_right != NIL {
                arena.set_parent(successor_right, p);
            }
            arena.set_left(successor, p_left);
            arena.set_parent(p_left, successor);
            arena.set_parent(successor, p_parent);
            if p_parent == NIL {
                root = successor;
            } else if p == arena.left(p_parent) {
                arena.set_left(p_parent, successor);
            } else {
                arena.set_right(p_parent, successor);
            }

            replacement = if successor_right != NIL {
                successor_right
            } else {
                p
            };
        } else if p_left != NIL {
            replacement = p_left;
        } else if p_right != NIL {
            replacement = p_right;
        } else {
            replacement = p;
        }

        if replacement != p {
            // `p` (at its potentially new position) has a child that takes its place
            let p_parent = arena.parent(p);
            arena.set_parent(replacement, p_parent);
            if p_parent == NIL {
                root = replacement;
            } else if p == arena.left(p_parent) {
                arena.set_left(p_parent, replacement);
            } else {
                arena.set_right(p_parent, replacement);
            }
            arena.set_parent(p, NIL);
            arena.set_left(p, NIL);
            arena.set_right(p, NIL);
        }

        if !arena.is_red(p) {
            root = arena.balance_deletion(root, replacement);
        }

        if p == replacement {
            // `p` is a leaf, cut it off
            let p_parent = arena.parent(p);
            if p_parent != NIL {
                if p == arena.left(p_parent) {
                    arena.set_left(p_parent, NIL);
                } else if p == arena.right(p_parent) {
                    arena.set_right(p_parent, NIL);
                }
                arena.set_parent(p, NIL);
            }
        }
        arena.root.store(root, Ordering::Release);
        self.unlock_root();

        if cfg!(debug_assertions) {
            arena.check_invariants(root);
        }
        false
    }

    /// Retires a tree bin whose values now live elsewhere.
    ///
    /// # Safety
    ///
    /// `bin` must be a `BinEntry::Tree` that has been unlinked from its table.
    pub(crate) unsafe fn defer_drop_without_values<'g>(
        bin: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) {
        guard.defer_unchecked(move || {
            if let BinEntry::Tree(mut tree_bin) = *bin.into_owned().into_box() {
                tree_bin.drop_fields(false);
            } else {
                unreachable!("bin is a tree bin");
            }
        });
    }

    /// Frees the arena and, if asked to, the values of its live entries.
    ///
    /// # Safety
    ///
    /// No other thread may still access the bin.
    pub(crate) unsafe fn drop_fields(&mut self, drop_values: bool) {
        let guard = crossbeam_epoch::unprotected();
        let arena = self.arena.swap(Shared::null(), Ordering::Relaxed, guard);
        if arena.is_null() {
            return;
        }
        let arena = arena.into_owned();
        if drop_values {
            for node in arena.iter() {
                let value = node.value.load(Ordering::Relaxed, guard);
                if !value.is_null() {
                    drop(value.into_owned());
                }
            }
        }
        drop(arena);
    }
}

impl<K, V> Drop for TreeBin<K, V> {
    fn drop(&mut self) {
        // safety: we have &mut self, so no one else can see the bin
        unsafe { self.drop_fields(true) };
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let waiter = self.waiter.swap(Shared::null(), Ordering::Relaxed, guard);
        if !waiter.is_null() {
            drop(unsafe { waiter.into_owned() });
        }
    }
}

// Red-black tree methods, all adapted from CLR
impl<K, V> Arena<K, V> {
    fn rotate_left(&self, mut root: u32, p: u32) -> u32 {
        if p == NIL {
            return root;
        }
        let right = self.right(p);
        if right == NIL {
            // there is no right successor to rotate left
            return root;
        }
        let right_left = self.left(right);
        self.set_right(p, right_left);
        if right_left != NIL {
            self.set_parent(right_left, p);
        }

        let p_parent = self.parent(p);
        self.set_parent(right, p_parent);
        if p_parent == NIL {
            root = right;
            self.set_red(right, false);
        } else if self.left(p_parent) == p {
            self.set_left(p_parent, right);
        } else {
            self.set_right(p_parent, right);
        }
        self.set_left(right, p);
        self.set_parent(p, right);
        root
    }

    fn rotate_right(&self, mut root: u32, p: u32) -> u32 {
        if p == NIL {
            return root;
        }
        let left = self.left(p);
        if left == NIL {
            // there is no left successor to rotate right
            return root;
        }
        let left_right = self.right(left);
        self.set_left(p, left_right);
        if left_right != NIL {
            self.set_parent(left_right, p);
        }

        let p_parent = self.parent(p);
        self.set_parent(left, p_parent);
        if p_parent == NIL {
            root = left;
            self.set_red(left, false);
        } else if self.right(p_parent) == p {
            self.set_right(p_parent, left);
        } else {
            self.set_left(p_parent, left);
        }
        self.set_right(left, p);
        self.set_parent(p, left);
        root
    }

    fn balance_insertion(&self, mut root: u32, mut x: u32) -> u32 {
        self.set_red(x, true);
        loop {
            let mut x_parent = self.parent(x);
            if x_parent == NIL {
                self.set_red(x, false);
                return x;
            }
            let mut x_parent_parent = self.parent(x_parent);
            if !self.is_red(x_parent) || x_parent_parent == NIL {
                return root;
            }
            let x_parent_parent_left = self.left(x_parent_parent);
            if x_parent == x_parent_parent_left {
                let x_parent_parent_right = self.right(x_parent_parent);
                if self.is_red(x_parent_parent_right) {
                    self.set_red(x_parent_parent_right, false);
                    self.set_red(x_parent, false);
                    self.set_red(x_parent_parent, true);
                    x = x_parent_parent;
                } else {
                    if x == self.right(x_parent) {
                        x = x_parent;
                        root = self.rotate_left(root, x);
                        x_parent = self.parent(x);
                        x_parent_parent = if x_parent == NIL {
                            NIL
                        } else {
                            self.parent(x_parent)
                        };
                    }
                    if x_parent != NIL {
                        self.set_red(x_parent, false);
                        if x_parent_parent != NIL {
                            self.set_red(x_parent_parent, true);
                            root = self.rotate_right(root, x_parent_parent);
                        }
                    }
                }
            } else if self.is_red(x_parent_parent_left) {
                self.set_red(x_parent_parent_left, false);
                self.set_red(x_parent, false);
                self.set_red(x_parent_parent, true);
                x = x_parent_parent;
            } else {
                if x == self.left(x_parent) {
                    x = x_parent;
                    root = self.rotate_right(root, x);
                    x_parent = self.parent(x);
                    x_parent_parent = if x_parent == NIL {
                        NIL
                    } else {
                        self.parent(x_parent)
                    };
                }
                if x_parent != NIL {
                    self.set_red(x_parent, false);
                    if x_parent_parent != NIL {
                        self.set_red(x_parent_parent, true);
                        root = self.rotate_left(root, x_parent_parent);
                    }
                }
            }
        }
    }

    fn balance_deletion(&self, mut root: u32, mut x: u32) -> u32 {
        loop {
            if x == NIL || x == root {
                return root;
            }
            let mut x_parent = self.parent(x);
            if x_parent == NIL {
                self.set_red(x, false);
                return x;
            } else if self.is_red(x) {
                self.set_red(x, false);
                return root;
            }
            let mut x_parent_left = self.left(x_parent);
            if x_parent_left == x {
                let mut x_parent_right = self.right(x_parent);
                if self.is_red(x_parent_right) {
                    self.set_red(x_parent_right, false);
                    self.set_red(x_parent, true);
                    root = self.rotate_left(root, x_parent);
                    x_parent = self.parent(x);
                    x_parent_right = if x_parent == NIL {
                        NIL
                    } else {
                        self.right(x_parent)
                    };
                }
                if x_parent_right == NIL {
                    x = x_parent;
                    continue;
                }
                let s_left = self.left(x_parent_right);
                let s_right = self.right(x_parent_right);
                if !self.is_red(s_right) && !self.is_red(s_left) {
                    self.set_red(x_parent_right, true);
                    x = x_parent;
                    continue;
                }
                if !self.is_red(s_right) {
                    self.set_red(s_left, false);
                    self.set_red(x_parent_right, true);
                    root = self.rotate_right(root, x_parent_right);
                    x_parent = self.parent(x);
                    x_parent_right = if x_parent == NIL {
                        NIL
                    } else {
                        self.right(x_parent)
                    };
                }
                if x_parent_right != NIL {
                    self.set_red(x_parent_right, x_parent != NIL && self.is_red(x_parent));
                    self.set_red(self.right(x_parent_right), false);
                }
                if x_parent != NIL {
                    self.set_red(x_parent, false);
                    root = self.rotate_left(root, x_parent);
                }
                x = root;
            } else {
                // symmetric
                if self.is_red(x_parent_left) {
                    self.set_red(x_parent_left, false);
                    self.set_red(x_parent, true);
                    root = self.rotate_right(root, x_parent);
                    x_parent = self.parent(x);
                    x_parent_left = if x_parent == NIL {
                        NIL
                    } else {
                        self.left(x_parent)
                    };
                }
                if x_parent_left == NIL {
                    x = x_parent;
                    continue;
                }
                let s_left = self.left(x_parent_left);
                let s_right = self.right(x_parent_left);
                if !self.is_red(s_left) && !self.is_red(s_right) {
                    self.set_red(x_parent_left, true);
                    x = x_parent;
                    continue;
                }
                if !self.is_red(s_left) {
                    self.set_red(s_right, false);
                    self.set_red(x_parent_left, true);
                    root = self.rotate_left(root, x_parent_left);
                    x_parent = self.parent(x);
                    x_parent_left = if x_parent == NIL {
                        NIL
                    } else {
                        self.left(x_parent)
                    };
                }
                if x_parent_left != NIL {
                    self.set_red(x_parent_left, x_parent != NIL && self.is_red(x_parent));
                    self.set_red(self.left(x_parent_left), false);
                }
                if x_parent != NIL {
                    self.set_red(x_parent, false);
                    root = self.rotate_right(root, x_parent);
                }
                x = root;
            }
        }
    }

    /// Checks the links and colours of the subtree rooted at `t`, returning
    /// its black height.
    fn check_invariants(&self, t: u32) -> usize {
        if t == NIL {
            return 1;
        }
        let t_node = self.node(t);
        let t_parent = self.parent(t);
        let t_left = self.left(t);
        let t_right = self.right(t);
        let t_prev = t_node.prev.load(Ordering::Relaxed);
        let t_next = t_node.next.load(Ordering::Relaxed);

        if t_prev != NIL {
            assert_eq!(
                self.next_of(t_prev),
                t,
                "A TreeNode's `prev` node did not point back to it as its `next` node"
            );
        }
        if t_next != NIL {
            assert_eq!(
                self.node(t_next).prev.load(Ordering::Relaxed),
                t,
                "A TreeNode's `next` node did not point back to it as its `prev` node"
            );
        }
        if t_parent != NIL {
            assert!(
                self.left(t_parent) == t || self.right(t_parent) == t,
                "A TreeNode's `parent` node did not point back to it as either its `left` or `right` child"
            );
        }
        if t_left != NIL {
            assert_eq!(
                self.parent(t_left),
                t,
                "A TreeNode's `left` child did not point back to it as its `parent` node"
            );
            assert!(
                self.node(t_left).hash <= t_node.hash,
                "A TreeNode's `left` child had a greater hash value than it"
            );
        }
        if t_right != NIL {
            assert_eq!(
                self.parent(t_right),
                t,
                "A TreeNode's `right` child did not point back to it as its `parent` node"
            );
            assert!(
                self.node(t_right).hash >= t_node.hash,
                "A TreeNode's `right` child had a smaller hash value than it"
            );
        }
        if self.is_red(t) {
            assert!(
                !self.is_red(t_left) && !self.is_red(t_right),
                "A red TreeNode had a red child"
            );
        }
        let left_height = self.check_invariants(t_left);
        let right_height = self.check_invariants(t_right);
        assert_eq!(
            left_height, right_height,
            "A TreeNode's subtrees had different black heights"
        );
        left_height + usize::from(!self.is_red(t))
    }
}
