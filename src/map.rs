use crate::config::{table_size_for_capacity, MapConfig, MAXIMUM_CAPACITY};
use crate::counter::{Add, ScalableCounter, NCPU};
use crate::error::Result;
use crate::iter::*;
use crate::node::*;
use crate::raw::*;
use crate::strategy::{spread, HashingStrategy};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use log::{debug, trace};
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::iter::FromIterator;
use std::sync::atomic::{AtomicIsize, Ordering};

const ISIZE_BITS: usize = core::mem::size_of::<isize>() * 8;

const DEFAULT_CAPACITY: usize = 16;

const TREEIFY_THRESHOLD: usize = 8;

const MIN_TREEIFY_CAPACITY: usize = 64;

const MIN_TRANSFER_STRIDE: isize = 16;

const RESIZE_STAMP_BITS: usize = ISIZE_BITS / 2;

const MAX_RESIZERS: isize = (1 << (ISIZE_BITS - RESIZE_STAMP_BITS)) - 1;

const RESIZE_STAMP_SHIFT: usize = ISIZE_BITS - RESIZE_STAMP_BITS;

macro_rules! load_factor {
    ($n: expr) => {
        $n - ($n >> 2)
    };
}

/// A concurrent hash table.
///
/// Lookups never block. Updates lock the single bin they touch, and a table
/// that fills up is grown by every thread that runs into the resize. Keys are
/// hashed, compared and ordered through the map's [`HashingStrategy`].
///
/// All references handed out by the map are tied to a [`Guard`]; the memory
/// behind them stays valid until the guard is dropped, even if the entry is
/// removed in the meantime.
pub struct HashMap<K, V, H = crate::DefaultHashing> {
    table: Atomic<Table<K, V>>,

    // the table being filled by a resize, only non-null while one runs
    next_table: Atomic<Table<K, V>>,

    // the next bin index (plus one) to hand out to a resizing thread
    transfer_index: AtomicIsize,

    count: ScalableCounter,

    // -1 while the table is being created, -(1 + helpers) while resizing,
    // otherwise the size of the first table (if none exists yet) or the
    // element count at which to resize next
    size_ctl: AtomicIsize,

    collector: epoch::Collector,

    strategy: H,
}

#[derive(Eq, PartialEq, Clone, Debug)]
enum PutResult<'a, T> {
    Inserted {
        new: &'a T,
    },
    Replaced {
        old: &'a T,
        new: &'a T,
    },
    Exists {
        current: &'a T,
        not_inserted: Box<T>,
    },
}

impl<'a, T> PutResult<'a, T> {
    fn before(&self) -> Option<&'a T> {
        match *self {
            PutResult::Inserted { .. } => None,
            PutResult::Replaced { old, .. } => Some(old),
            PutResult::Exists { current, .. } => Some(current),
        }
    }
}

/// The error returned by [`HashMap::try_insert`] when the key already has a
/// value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TryInsertError<'a, V> {
    /// The value the key is mapped to.
    pub current: &'a V,
    /// The value that was not inserted.
    pub not_inserted: V,
}

impl<'a, V> Display for TryInsertError<'a, V>
where
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Insert of \"{:?}\" failed as key was already present with value \"{:?}\"",
            self.not_inserted, self.current
        )
    }
}

impl<'a, V> Error for TryInsertError<'a, V>
where
    V: Debug,
{
    #[inline]
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

/// Puts a reserved bin back to empty if the mapping function unwinds.
struct Reservation<'g, K, V> {
    table: &'g Table<K, V>,
    bini: usize,
    node: Shared<'g, BinEntry<K, V>>,
    guard: &'g Guard,
}

impl<K, V> Drop for Reservation<'_, K, V> {
    fn drop(&mut self) {
        if self.table.bin(self.bini, self.guard) == self.node {
            self.table.store_bin(self.bini, Shared::null());
        }
        unsafe { self.guard.defer_destroy(self.node) };
    }
}

/// Blocks until another thread's `compute_if_absent` on this bin finishes.
fn wait_for_reservation(reservation: &ReservationNode) {
    if reservation.owner == std::thread::current().id() {
        panic!("recursive update: the map was modified from inside compute_if_absent");
    }
    drop(reservation.lock.lock());
}

/// The chain node behind `p`.
///
/// # Safety
///
/// `p` must be non-null, protected by the guard it was loaded under, and
/// part of a chain.
#[inline]
unsafe fn chain_node<'g, K, V>(p: Shared<'g, BinEntry<K, V>>) -> &'g Node<K, V> {
    match p.deref() {
        BinEntry::Node(n) => n,
        _ => unreachable!("BinEntry::Node only points to BinEntry::Node"),
    }
}

impl<K, V, H> HashMap<K, V, H>
where
    H: Default,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// A map that holds `capacity` entries before it first resizes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_strategy(capacity, H::default())
    }

    pub fn with_config(config: MapConfig) -> Result<Self> {
        Self::with_config_and_strategy(config, H::default())
    }
}

impl<K, V, H> Default for HashMap<K, V, H>
where
    H: Default,
{
    fn default() -> Self {
        Self::with_strategy(H::default())
    }
}

impl<K, V, H> HashMap<K, V, H> {
    pub fn with_strategy(strategy: H) -> Self {
        Self {
            table: Atomic::null(),
            next_table: Atomic::null(),
            transfer_index: AtomicIsize::new(0),
            count: ScalableCounter::new(),
            size_ctl: AtomicIsize::new(0),
            strategy,
            collector: epoch::default_collector().clone(),
        }
    }

    pub fn with_capacity_and_strategy(capacity: usize, strategy: H) -> Self {
        let map = Self::with_strategy(strategy);
        if capacity > 0 {
            // the table itself is created on first use
            map.size_ctl
                .store(table_size_for_capacity(capacity) as isize, Ordering::SeqCst);
        }
        map
    }

    pub fn with_config_and_strategy(config: MapConfig, strategy: H) -> Result<Self> {
        let size = config.table_size()?;
        let map = Self::with_strategy(strategy);
        map.size_ctl.store(size as isize, Ordering::SeqCst);
        Ok(map)
    }

    /// The strategy used to hash and compare keys.
    pub fn strategy(&self) -> &H {
        &self.strategy
    }

    pub fn guard(&self) -> epoch::Guard {
        self.collector.register().pin()
    }

    #[inline]
    fn check_guard(&self, guard: &Guard) {
        if let Some(c) = guard.collector() {
            assert_eq!(c, &self.collector);
        }
    }

    fn sum_count(&self) -> isize {
        let guard = self.guard();
        self.count.sum(&guard)
    }

    /// Number of entries, as seen by a snapshot of the size counter.
    pub fn len(&self) -> usize {
        let n = self.sum_count();
        if n < 0 {
            0
        } else {
            n as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sum_count() <= 0
    }

    /// Like [`len`](Self::len), for maps that may outgrow `usize` counts on
    /// narrow targets.
    pub fn mapping_count(&self) -> u64 {
        self.sum_count().max(0) as u64
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self, guard: &Guard) -> usize {
        self.check_guard(guard);
        let table = self.table.load(Ordering::Relaxed, guard);

        if table.is_null() {
            0
        } else {
            unsafe { table.deref() }.len()
        }
    }

    fn resize_stamp(n: usize) -> isize {
        n.leading_zeros() as isize | (1_isize << (RESIZE_STAMP_BITS - 1))
    }

    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        let node_iter = NodeIter::new(table, guard);
        Iter { node_iter, guard }
    }

    pub fn keys<'g>(&'g self, guard: &'g Guard) -> Keys<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        let node_iter = NodeIter::new(table, guard);
        Keys { node_iter }
    }

    pub fn values<'g>(&'g self, guard: &'g Guard) -> Values<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        let node_iter = NodeIter::new(table, guard);
        Values { node_iter, guard }
    }

    /// Same as [`values`](Self::values).
    pub fn elements<'g>(&'g self, guard: &'g Guard) -> Values<'g, K, V> {
        self.values(guard)
    }

    /// Copies the keys present at some point during the call into a vector.
    pub fn keys_snapshot(&self, guard: &Guard) -> Vec<K>
    where
        K: Clone,
    {
        self.keys(guard).cloned().collect()
    }

    fn init_table<'g>(&'g self, guard: &'g Guard) -> Shared<'g, Table<K, V>> {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            if !table.is_null() && !unsafe { table.deref() }.is_empty() {
                break table;
            }
            let mut sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                // someone else is creating the table
                std::thread::yield_now();
                continue;
            }

            if self
                .size_ctl
                .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                let mut table = self.table.load(Ordering::SeqCst, guard);

                if table.is_null() || unsafe { table.deref() }.is_empty() {
                    let n = if sc > 0 { sc as usize } else { DEFAULT_CAPACITY };
                    let new_table = Owned::new(Table::new(n));
                    table = new_table.into_shared(guard);
                    self.table.store(table, Ordering::SeqCst);
                    sc = load_factor!(n as isize)
                }
                self.size_ctl.store(sc, Ordering::SeqCst);
                break table;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn bin_addr(&self, key: &K, guard: &Guard) -> Option<usize>
    where
        H: HashingStrategy<K>,
    {
        let table = unsafe { self.table.load(Ordering::SeqCst, guard).as_ref() }?;
        let bin = table.bin(table.bini(self.hash(key)), guard);
        if bin.is_null() {
            None
        } else {
            Some(bin.as_raw() as usize)
        }
    }

    #[cfg(test)]
    pub(crate) fn bin_kind(&self, key: &K, guard: &Guard) -> Option<&'static str>
    where
        H: HashingStrategy<K>,
    {
        let table = unsafe { self.table.load(Ordering::SeqCst, guard).as_ref() }?;
        let bin = table.bin(table.bini(self.hash(key)), guard);
        Some(match unsafe { bin.as_ref() }? {
            BinEntry::Node(_) => "chain",
            BinEntry::Tree(_) => "tree",
            BinEntry::Moved => "moved",
            BinEntry::Reserved(_) => "reserved",
        })
    }
}

impl<K, V, H> HashMap<K, V, H>
where
    K: Clone,
    H: HashingStrategy<K>,
{
    fn try_presize(&self, size: usize, guard: &Guard) {
        let requested_capacity = table_size_for_capacity(size) as isize;

        loop {
            let size_ctl = self.size_ctl.load(Ordering::SeqCst);
            if size_ctl < 0 {
                break;
            }

            let table = self.table.load(Ordering::SeqCst, guard);

            let current_capacity = if table.is_null() {
                0
            } else {
                unsafe { table.deref() }.len()
            };

            if current_capacity == 0 {
                // the table has not been created yet, create it at the larger size
                let initial_capacity = size_ctl;

                let new_capacity = requested_capacity.max(initial_capacity) as usize;

                if self
                    .size_ctl
                    .compare_exchange(size_ctl, -1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }

                if self.table.load(Ordering::SeqCst, guard) != table {
                    self.size_ctl.store(size_ctl, Ordering::SeqCst);
                    continue;
                }

                let new_table = Owned::new(Table::new(new_capacity)).into_shared(guard);

                let old_table = self.table.swap(new_table, Ordering::SeqCst, guard);

                assert!(old_table.is_null());

                let new_load_to_resize_at = load_factor!(new_capacity as isize);

                self.size_ctl.store(new_load_to_resize_at, Ordering::SeqCst);
            } else if requested_capacity <= size_ctl || current_capacity >= MAXIMUM_CAPACITY {
                break;
            } else if table == self.table.load(Ordering::SeqCst, guard) {
                let rs: isize = Self::resize_stamp(current_capacity) << RESIZE_STAMP_SHIFT;

                if self
                    .size_ctl
                    .compare_exchange(size_ctl, rs + 2, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    self.transfer(table, Shared::null(), guard);
                }
            }
        }
    }

    /// Moves the bins of `table` into `next_table`, allocating it if null.
    #[inline(never)]
    fn transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        mut next_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard,
    ) {
        let n = unsafe { table.deref() }.len();
        let ncpu = num_cpus();

        let stride = if ncpu > 1 { (n >> 3) / ncpu } else { n };
        let stride = std::cmp::max(stride as isize, MIN_TRANSFER_STRIDE);

        if next_table.is_null() {
            // we are the initiating thread
            let table = Owned::new(Table::new(n << 1));
            let now_garbage = self.next_table.swap(table, Ordering::SeqCst, guard);
            assert!(now_garbage.is_null());
            self.transfer_index.store(n as isize, Ordering::SeqCst);
            next_table = self.next_table.load(Ordering::Relaxed, guard);
            debug!("resizing table from {} to {} bins", n, n << 1);
        }

        let next_n = unsafe { next_table.deref() }.len();

        let mut advance = true;
        let mut finishing = false;
        let mut i = 0;
        let mut bound = 0;
        loop {
            // try to claim a range of bins for us to transfer
            while advance {
                i -= 1;
                if i >= bound || finishing {
                    advance = false;
                    break;
                }

                let next_index = self.transfer_index.load(Ordering::SeqCst);
                if next_index <= 0 {
                    i = -1;
                    advance = false;
                    break;
                }

                let next_bound = if next_index > stride {
                    next_index - stride
                } else {
                    0
                };
                if self
                    .transfer_index
                    .compare_exchange(next_index, next_bound, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    bound = next_bound;
                    i = next_index;
                    advance = false;
                    break;
                }
            }

            if i < 0 || i as usize >= n || i as usize + n >= next_n {
                // the resize has finished

                if finishing {
                    // this branch is only taken for one thread partaking in the resize
                    self.next_table.store(Shared::null(), Ordering::SeqCst);
                    let now_garbage = self.table.swap(next_table, Ordering::SeqCst, guard);
                    unsafe { guard.defer_destroy(now_garbage) };
                    self.size_ctl
                        .store(((n as isize) << 1) - ((n as isize) >> 1), Ordering::SeqCst);
                    debug!("resize to {} bins complete", n << 1);
                    return;
                }

                let sc = self.size_ctl.load(Ordering::SeqCst);
                if self
                    .size_ctl
                    .compare_exchange(sc, sc - 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    if (sc - 2) != Self::resize_stamp(n) << RESIZE_STAMP_SHIFT {
                        return;
                    }

                    // we are the last thread out, recheck the whole table
                    // before committing
                    finishing = true;

                    advance = true;

                    i = n as isize;
                }

                continue;
            }
            let i = i as usize;

            let table = unsafe { table.deref() };

            let bin = table.bin(i, guard);
            if bin.is_null() {
                advance = table
                    .cas_bin(i, Shared::null(), table.get_moved(next_table, guard), guard)
                    .is_ok();
                continue;
            }
            let next_table = unsafe { next_table.deref() };

            match *unsafe { bin.deref() } {
                BinEntry::Moved => {
                    // already processed
                    advance = true;
                }
                BinEntry::Reserved(ref reservation) => {
                    // retry once the computation has filled the bin
                    wait_for_reservation(reservation);
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    // another thread may have changed the head while we were locking
                    let current_head = table.bin(i, guard);
                    if current_head.as_raw() != bin.as_raw() {
                        continue;
                    }

                    // the trailing run of nodes that all go to the same half
                    // can be moved over as is
                    let mut run_bit = head.hash & n as u64;
                    let mut last_run = bin;
                    let mut p = bin;
                    loop {
                        let node = unsafe { chain_node(p) };
                        let next = node.next.load(Ordering::SeqCst, guard);

                        let b = node.hash & n as u64;
                        if b != run_bit {
                            run_bit = b;
                            last_run = p;
                        }

                        if next.is_null() {
                            break;
                        }
                        p = next;
                    }

                    let mut low_bin = Shared::null();
                    let mut high_bin = Shared::null();
                    if run_bit == 0 {
                        low_bin = last_run;
                    } else {
                        high_bin = last_run;
                    }

                    p = bin;
                    while p != last_run {
                        let node = unsafe { chain_node(p) };

                        let link = if node.hash & n as u64 == 0 {
                            &mut low_bin
                        } else {
                            &mut high_bin
                        };

                        *link = Owned::new(BinEntry::Node(Node::with_next(
                            node.hash,
                            node.key.clone(),
                            node.value.clone(),
                            Atomic::from(*link),
                        )))
                        .into_shared(guard);

                        p = node.next.load(Ordering::SeqCst, guard);
                    }

                    next_table.store_bin(i, low_bin);
                    next_table.store_bin(i + n, high_bin);
                    table.store_bin(
                        i,
                        table.get_moved(Shared::from(next_table as *const _), guard),
                    );

                    // the copied nodes are garbage now, their values live on
                    p = bin;
                    while p != last_run {
                        let next = unsafe { chain_node(p) }.next.load(Ordering::SeqCst, guard);
                        unsafe { guard.defer_destroy(p) };
                        p = next;
                    }

                    advance = true;

                    drop(head_lock);
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();

                    let current_head = table.bin(i, guard);
                    if current_head != bin {
                        continue;
                    }

                    let mut low = Vec::new();
                    let mut high = Vec::new();
                    for node in tree_bin.arena(guard).iter() {
                        if node.hash & n as u64 == 0 {
                            low.push(node);
                        } else {
                            high.push(node);
                        }
                    }
                    let (low_count, high_count) = (low.len(), high.len());

                    // a side that takes every node keeps the old bin as is
                    let mut reused_bin = false;
                    let low_bin = if low_count <= UNTREEIFY_THRESHOLD {
                        Self::untreeify(low.into_iter(), guard)
                    } else if high_count != 0 {
                        self.treeify(low.into_iter(), guard)
                    } else {
                        reused_bin = true;
                        bin
                    };
                    let high_bin = if high_count <= UNTREEIFY_THRESHOLD {
                        Self::untreeify(high.into_iter(), guard)
                    } else if low_count != 0 {
                        self.treeify(high.into_iter(), guard)
                    } else {
                        reused_bin = true;
                        bin
                    };

                    next_table.store_bin(i, low_bin);
                    next_table.store_bin(i + n, high_bin);
                    table.store_bin(
                        i,
                        table.get_moved(Shared::from(next_table as *const _), guard),
                    );

                    if !reused_bin {
                        unsafe { TreeBin::defer_drop_without_values(bin, guard) };
                    }

                    advance = true;
                    drop(bin_lock);
                }
            }
        }
    }

    fn help_transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, Table<K, V>> {
        if table.is_null() {
            return table;
        }

        let next_table = unsafe { table.deref() }.next_table(guard);
        if next_table.is_null() {
            return table;
        }

        let rs = Self::resize_stamp(unsafe { table.deref() }.len()) << RESIZE_STAMP_SHIFT;

        while next_table == self.next_table.load(Ordering::SeqCst, guard)
            && table == self.table.load(Ordering::SeqCst, guard)
        {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc >= 0
                || sc >> RESIZE_STAMP_SHIFT != rs >> RESIZE_STAMP_SHIFT
                || sc == rs + MAX_RESIZERS
                || sc == rs + 1
                || self.transfer_index.load(Ordering::SeqCst) <= 0
            {
                break;
            }

            if self
                .size_ctl
                .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.transfer(table, next_table, guard);
                break;
            }
        }
        next_table
    }

    /// Adds `n` to the size and, for insertions, starts or joins a resize if
    /// the table is full. `resize_hint` is the number of entries seen in the
    /// modified bin, or `None` for removals.
    fn add_count(&self, n: isize, resize_hint: Option<usize>, guard: &Guard) {
        let mut count = match self.count.add(n, guard) {
            Add::Base(sum) => sum,
            Add::Cell => match resize_hint {
                Some(seen) if seen > 1 => self.count.sum(guard),
                _ => return,
            },
            Add::Contended => return,
        };

        if resize_hint.is_none() {
            return;
        }

        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if count < sc {
                break;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            if table.is_null() {
                break;
            }

            let n = unsafe { table.deref() }.len();
            if n >= MAXIMUM_CAPACITY {
                break;
            }

            let rs = Self::resize_stamp(n) << RESIZE_STAMP_SHIFT;
            if sc < 0 {
                // a resize is in progress, help if it is this table's resize
                // and there is still work to hand out
                if sc >> RESIZE_STAMP_SHIFT != rs >> RESIZE_STAMP_SHIFT
                    || sc == rs + MAX_RESIZERS
                    || sc == rs + 1
                {
                    break;
                }
                let nt = self.next_table.load(Ordering::SeqCst, guard);
                if nt.is_null() {
                    break;
                }
                if self.transfer_index.load(Ordering::SeqCst) <= 0 {
                    break;
                }

                if self
                    .size_ctl
                    .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    self.transfer(table, nt, guard);
                }
            } else if self
                .size_ctl
                .compare_exchange(sc, rs + 2, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.transfer(table, Shared::null(), guard);
            }

            count = self.count.sum(guard);
        }
    }

    /// Makes room for `additional` more entries without further resizing.
    pub fn reserve(&self, additional: usize, guard: &Guard) {
        self.check_guard(guard);
        let absolute = self.len() + additional;
        self.try_presize(absolute, guard);
    }

    /// Turns the chain at `index` into a tree bin, or grows a small table
    /// instead.
    fn treeify_bin<'g>(&'g self, tab: &Table<K, V>, index: usize, guard: &'g Guard) {
        let n = tab.len();
        if n < MIN_TREEIFY_CAPACITY {
            self.try_presize(n << 1, guard);
            return;
        }

        let bin = tab.bin(index, guard);
        if bin.is_null() {
            return;
        }
        if let BinEntry::Node(ref node) = unsafe { bin.deref() } {
            let lock = node.lock.lock();
            if tab.bin(index, guard) != bin {
                return;
            }

            let mut entries = Vec::new();
            let mut e = bin;
            while !e.is_null() {
                let e_deref = unsafe { chain_node(e) };
                entries.push(TreeNode::new(
                    e_deref.hash,
                    e_deref.key.clone(),
                    e_deref.value.clone(),
                ));
                e = e_deref.next.load(Ordering::SeqCst, guard);
            }
            let len = entries.len();
            tab.store_bin(
                index,
                Owned::new(BinEntry::Tree(TreeBin::new(entries, &self.strategy))),
            );
            drop(lock);
            trace!("bin {} of {} turned into a tree of {} entries", index, n, len);

            // the old chain is garbage now, its values live on in the tree
            e = bin;
            while !e.is_null() {
                unsafe {
                    let next = chain_node(e).next.load(Ordering::SeqCst, guard);
                    guard.defer_destroy(e);
                    e = next;
                }
            }
        }
    }

    /// A new tree bin holding copies of `nodes`, sharing their values.
    fn treeify<'g, I>(&self, nodes: I, guard: &'g Guard) -> Shared<'g, BinEntry<K, V>>
    where
        I: Iterator<Item = &'g TreeNode<K, V>>,
    {
        let entries = nodes
            .map(|n| TreeNode::new(n.hash, n.key.clone(), n.value.clone()))
            .collect();
        Owned::new(BinEntry::Tree(TreeBin::new(entries, &self.strategy))).into_shared(guard)
    }

    /// A chain holding copies of `nodes`, in order, sharing their values.
    fn untreeify<'g, I>(nodes: I, guard: &'g Guard) -> Shared<'g, BinEntry<K, V>>
    where
        I: Iterator<Item = &'g TreeNode<K, V>>,
    {
        let mut head = Shared::null();
        let mut tail: Shared<'_, BinEntry<K, V>> = Shared::null();
        let mut len = 0;
        for q in nodes {
            let new_node = Owned::new(BinEntry::Node(Node::new(
                q.hash,
                q.key.clone(),
                q.value.clone(),
            )))
            .into_shared(guard);
            if tail.is_null() {
                head = new_node;
            } else {
                unsafe { chain_node(tail) }
                    .next
                    .store(new_node, Ordering::Relaxed);
            }
            tail = new_node;
            len += 1;
        }
        if len > 0 {
            trace!("tree bin turned back into a chain of {} entries", len);
        }
        head
    }
}

impl<K, V, H> HashMap<K, V, H>
where
    H: HashingStrategy<K>,
{
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        spread(self.strategy.hash(key))
    }

    fn get_entry<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<EntryRef<'g, K, V>> {
        let table = self.table.load(Ordering::SeqCst, guard);
        let table = unsafe { table.as_ref() }?;
        if table.is_empty() {
            return None;
        }

        let h = self.hash(key);
        let bin = table.bin(table.bini(h), guard);
        let bin = unsafe { bin.as_ref() }?;
        table.find(bin, h, key, &self.strategy, guard)
    }

    pub fn contains_key(&self, key: &K, guard: &Guard) -> bool {
        self.check_guard(guard);
        self.get_entry(key, guard).is_some()
    }

    #[inline]
    pub fn get<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        self.check_guard(guard);
        let (_, value) = self.get_entry(key, guard)?;

        let v = value.load(Ordering::SeqCst, guard);
        assert!(!v.is_null());
        unsafe { v.as_ref() }
    }

    #[inline]
    pub fn get_key_value<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<(&'g K, &'g V)> {
        self.check_guard(guard);
        let (key, value) = self.get_entry(key, guard)?;

        let v = value.load(Ordering::SeqCst, guard);
        assert!(!v.is_null());
        unsafe { v.as_ref() }.map(|v| (key, v))
    }

    /// The value of `key`, or `default` if it has none.
    pub fn get_or_default<'g>(&'g self, key: &K, default: &'g V, guard: &'g Guard) -> &'g V {
        self.get(key, guard).unwrap_or(default)
    }

    /// Whether some key maps to `value`. Walks the whole map.
    pub fn contains_value(&self, value: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        self.values(guard).any(|v| v == value)
    }

    pub(crate) fn guarded_eq(&self, other: &Self, our_guard: &Guard, their_guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        if self.len() != other.len() {
            return false;
        }

        self.iter(our_guard)
            .all(|(key, value)| other.get(key, their_guard).map_or(false, |v| *value == *v))
    }
}

impl<K, V, H> HashMap<K, V, H>
where
    K: Clone,
    H: HashingStrategy<K>,
{
    /// Removes every entry, bin by bin.
    pub fn clear(&self, guard: &Guard) {
        self.check_guard(guard);
        let mut delta = 0;
        let mut idx = 0usize;

        let mut table = self.table.load(Ordering::SeqCst, guard);
        while !table.is_null() && idx < unsafe { table.deref() }.len() {
            let tab = unsafe { table.deref() };
            let raw_node = tab.bin(idx, guard);
            if raw_node.is_null() {
                idx += 1;
                continue;
            }
            match unsafe { raw_node.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    idx = 0;
                }
                BinEntry::Reserved(ref reservation) => {
                    // clear whatever the computation puts there
                    wait_for_reservation(reservation);
                }
                BinEntry::Node(ref node) => {
                    let head_lock = node.lock.lock();
                    let current_head = tab.bin(idx, guard);
                    if current_head != raw_node {
                        continue;
                    }
                    tab.store_bin(idx, Shared::null());
                    drop(head_lock);
                    let mut p = raw_node;
                    while !p.is_null() {
                        delta -= 1;
                        p = {
                            let node = unsafe { chain_node(p) };
                            let next = node.next.load(Ordering::SeqCst, guard);
                            let value = node.value.load(Ordering::SeqCst, guard);

                            unsafe { guard.defer_destroy(value) };
                            unsafe { guard.defer_destroy(p) };
                            next
                        };
                    }
                    idx += 1;
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    let current_head = tab.bin(idx, guard);
                    if current_head != raw_node {
                        continue;
                    }
                    tab.store_bin(idx, Shared::null());
                    drop(bin_lock);
                    delta -= tree_bin.arena(guard).live() as isize;
                    // dropping the bin drops the values still in it
                    unsafe { guard.defer_destroy(raw_node) };
                    idx += 1;
                }
            };
        }

        if delta != 0 {
            self.add_count(delta, None, guard);
        }
    }
}

impl<K, V, H> HashMap<K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send,
    H: HashingStrategy<K>,
{
    /// Maps `key` to `value`, returning the previous value if there was one.
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        self.check_guard(guard);
        self.put(key, value, false, guard).before()
    }

    /// Maps `key` to `value` unless the key already has a value.
    #[inline]
    pub fn try_insert<'g>(
        &'g self,
        key: K,
        value: V,
        guard: &'g Guard,
    ) -> std::result::Result<&'g V, TryInsertError<'g, V>> {
        self.check_guard(guard);
        match self.put(key, value, true, guard) {
            PutResult::Exists {
                current,
                not_inserted,
            } => Err(TryInsertError {
                current,
                not_inserted: *not_inserted,
            }),
            PutResult::Inserted { new } => Ok(new),
            PutResult::Replaced { .. } => {
                unreachable!("no_replacement cannot result in PutResult::Replaced")
            }
        }
    }

    /// Maps `key` to `value` unless the key already has a value, returning
    /// that value if so.
    pub fn put_if_absent<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        self.check_guard(guard);
        self.put(key, value, true, guard).before()
    }

    /// The value of `key`, inserting `value` first if there is none.
    pub fn cache_or_get<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> &'g V {
        if let Some(current) = self.get(&key, guard) {
            return current;
        }
        match self.try_insert(key, value, guard) {
            Ok(new) => new,
            Err(TryInsertError { current, .. }) => current,
        }
    }

    fn put<'g>(
        &'g self,
        mut key: K,
        value: V,
        no_replacement: bool,
        guard: &'g Guard,
    ) -> PutResult<'g, V> {
        let hash = self.hash(&key);
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut bin_count;
        let value = Owned::new(value).into_shared(guard);
        let mut old_val = None;
        loop {
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                table = self.init_table(guard);
                continue;
            }

            let t = unsafe { table.deref() };

            let bini = t.bini(hash);
            let mut bin = t.bin(bini, guard);
            if bin.is_null() {
                // fast path: the bin is empty, so stick us at the front
                let node = Owned::new(BinEntry::Node(Node::new(hash, key, value)));
                match t.cas_bin(bini, bin, node, guard) {
                    Ok(_old_null_ptr) => {
                        self.add_count(1, Some(0), guard);
                        guard.flush();
                        return PutResult::Inserted {
                            new: unsafe { value.deref() },
                        };
                    }
                    Err(changed) => {
                        assert!(!changed.current.is_null());
                        bin = changed.current;
                        if let BinEntry::Node(node) = *changed.new.into_box() {
                            key = node.key;
                        } else {
                            unreachable!("we declared node and it is a BinEntry::Node");
                        }
                    }
                }
            }

            match *unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Reserved(ref reservation) => {
                    wait_for_reservation(reservation);
                    continue;
                }
                BinEntry::Node(ref head)
                    if no_replacement
                        && head.hash == hash
                        && self.strategy.equals(&head.key, &key) =>
                {
                    // the key is at the head of the bin, no need to lock
                    let v = head.value.load(Ordering::SeqCst, guard);
                    return PutResult::Exists {
                        current: unsafe { v.deref() },
                        not_inserted: unsafe { value.into_owned().into_box() },
                    };
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    let current_head = t.bin(bini, guard);
                    if current_head != bin {
                        continue;
                    }

                    bin_count = 1;
                    let mut p = bin;

                    old_val = loop {
                        let n = unsafe { chain_node(p) };
                        if n.hash == hash && self.strategy.equals(&n.key, &key) {
                            let current_value = n.value.load(Ordering::SeqCst, guard);

                            let current_value = unsafe { current_value.deref() };

                            if no_replacement {
                                return PutResult::Exists {
                                    current: current_value,
                                    not_inserted: unsafe { value.into_owned().into_box() },
                                };
                            } else {
                                let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);

                                unsafe { guard.defer_destroy(now_garbage) };
                            }
                            break Some(current_value);
                        }

                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            let node = Owned::new(BinEntry::Node(Node::new(hash, key, value)));
                            n.next.store(node, Ordering::SeqCst);
                            break None;
                        }
                        p = next;

                        bin_count += 1;
                    };
                    drop(head_lock);
                }
                BinEntry::Tree(ref tree_bin) => {
                    let head_lock = tree_bin.lock.lock();

                    let current_head = t.bin(bini, guard);
                    if current_head != bin {
                        continue;
                    }

                    bin_count = 2;
                    let tree_node = match tree_bin.find_or_put_tree_val(
                        hash,
                        key,
                        value,
                        &self.strategy,
                        guard,
                    ) {
                        Some(tree_node) => tree_node,
                        None => break,
                    };
                    old_val = {
                        let current_value = tree_node.value.load(Ordering::SeqCst, guard);
                        let current_value = unsafe { current_value.deref() };
                        if no_replacement {
                            return PutResult::Exists {
                                current: current_value,
                                not_inserted: unsafe { value.into_owned().into_box() },
                            };
                        } else {
                            let now_garbage = tree_node.value.swap(value, Ordering::SeqCst, guard);

                            unsafe { guard.defer_destroy(now_garbage) };
                        }
                        Some(current_value)
                    };
                    drop(head_lock);
                }
            }
            debug_assert_ne!(bin_count, 0);
            if bin_count >= TREEIFY_THRESHOLD {
                self.treeify_bin(t, bini, guard);
            }
            if let Some(old_val) = old_val {
                return PutResult::Replaced {
                    old: old_val,
                    new: unsafe { value.deref() },
                };
            }
            break;
        }
        debug_assert!(old_val.is_none());
        self.add_count(1, Some(bin_count), guard);
        guard.flush();
        PutResult::Inserted {
            new: unsafe { value.deref() },
        }
    }

    fn put_all<I: Iterator<Item = (K, V)>>(&self, iter: I, guard: &Guard) {
        for (key, value) in iter {
            self.put(key, value, false, guard);
        }
    }

    /// Returns the value of `key`, computing and inserting one with
    /// `mapping_function` if the key has none.
    ///
    /// Returns `None` if the function declines to produce a value. The
    /// function runs while the key's bin is locked: it must be short and must
    /// not update this map. Updating the map from inside the function panics
    /// if it reaches the bin being computed.
    pub fn compute_if_absent<'g, F>(
        &'g self,
        key: K,
        mapping_function: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        F: FnOnce(&K) -> Option<V>,
    {
        self.check_guard(guard);
        let hash = self.hash(&key);
        let mut table = self.table.load(Ordering::SeqCst, guard);
        loop {
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                table = self.init_table(guard);
                continue;
            }

            let t = unsafe { table.deref() };

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                // hold the bin with a locked placeholder while computing
                let node = Owned::new(BinEntry::Reserved(ReservationNode::new())).into_shared(guard);
                let reservation = match unsafe { node.deref() } {
                    BinEntry::Reserved(ref reservation) => reservation,
                    _ => unreachable!("we declared node and it is a BinEntry::Reserved"),
                };
                let reservation_lock = reservation.lock.lock();
                if t.cas_bin(bini, Shared::null(), node, guard).is_err() {
                    drop(reservation_lock);
                    drop(unsafe { node.into_owned() });
                    continue;
                }
                let reserved = Reservation {
                    table: t,
                    bini,
                    node,
                    guard,
                };

                let value = mapping_function(&key).map(|value| Owned::new(value).into_shared(guard));
                if let Some(value) = value {
                    t.store_bin(bini, Owned::new(BinEntry::Node(Node::new(hash, key, value))));
                }
                drop(reserved);
                drop(reservation_lock);

                let value = value?;
                self.add_count(1, Some(1), guard);
                return Some(unsafe { value.deref() });
            }

            match *unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Reserved(ref reservation) => {
                    wait_for_reservation(reservation);
                    continue;
                }
                BinEntry::Node(ref head)
                    if head.hash == hash && self.strategy.equals(&head.key, &key) =>
                {
                    let v = head.value.load(Ordering::SeqCst, guard);
                    return unsafe { v.as_ref() };
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut bin_count = 1;
                    let mut n = head;
                    loop {
                        if n.hash == hash && self.strategy.equals(&n.key, &key) {
                            let v = n.value.load(Ordering::SeqCst, guard);
                            return unsafe { v.as_ref() };
                        }
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            break;
                        }
                        n = unsafe { chain_node(next) };
                        bin_count += 1;
                    }

                    let value = Owned::new(mapping_function(&key)?).into_shared(guard);
                    n.next.store(
                        Owned::new(BinEntry::Node(Node::new(hash, key, value))),
                        Ordering::SeqCst,
                    );
                    drop(head_lock);

                    if bin_count >= TREEIFY_THRESHOLD {
                        self.treeify_bin(t, bini, guard);
                    }
                    self.add_count(1, Some(bin_count), guard);
                    guard.flush();
                    return Some(unsafe { value.deref() });
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    if let Some((_, node)) = tree_bin.find_locked(hash, &key, &self.strategy, guard)
                    {
                        let v = node.value.load(Ordering::SeqCst, guard);
                        return unsafe { v.as_ref() };
                    }

                    let value = Owned::new(mapping_function(&key)?).into_shared(guard);
                    let existing =
                        tree_bin.find_or_put_tree_val(hash, key, value, &self.strategy, guard);
                    debug_assert!(existing.is_none());
                    drop(bin_lock);

                    self.add_count(1, Some(2), guard);
                    guard.flush();
                    return Some(unsafe { value.deref() });
                }
            }
        }
    }

    /// Replaces the value of `key` with `remapping_function(key, value)`, or
    /// removes the entry if that returns `None`. Does nothing if `key` has
    /// no value.
    pub fn compute_if_present<'g, F>(
        &'g self,
        key: &K,
        remapping_function: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        F: FnOnce(&K, &V) -> Option<V>,
    {
        self.check_guard(guard);
        let hash = self.hash(key);

        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut removed_node = false;
        let new_val = loop {
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                return None;
            }

            let t = unsafe { table.deref() };

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                return None;
            }

            match *unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Reserved(_) => return None,
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut p = bin;
                    let mut pred: Shared<'_, BinEntry<K, V>> = Shared::null();

                    let found = loop {
                        let n = unsafe { chain_node(p) };
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash == hash && self.strategy.equals(&n.key, key) {
                            let current_value = n.value.load(Ordering::SeqCst, guard);

                            let new_value =
                                remapping_function(&n.key, unsafe { current_value.deref() });

                            if let Some(value) = new_value {
                                let value = Owned::new(value).into_shared(guard);
                                let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);

                                unsafe { guard.defer_destroy(now_garbage) };

                                break Some(unsafe { value.deref() });
                            } else {
                                removed_node = true;
                                if !pred.is_null() {
                                    unsafe { chain_node(pred) }
                                        .next
                                        .store(next, Ordering::SeqCst);
                                } else {
                                    t.store_bin(bini, next);
                                }

                                unsafe { guard.defer_destroy(p) };
                                unsafe { guard.defer_destroy(current_value) };
                                break None;
                            }
                        }

                        pred = p;
                        if next.is_null() {
                            break None;
                        }
                        p = next;
                    };
                    drop(head_lock);
                    break found;
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let found = match tree_bin.find_locked(hash, key, &self.strategy, guard) {
                        None => None,
                        Some((i, n)) => {
                            let current_value = n.value.load(Ordering::SeqCst, guard);

                            let new_value =
                                remapping_function(&n.key, unsafe { current_value.deref() });

                            if let Some(value) = new_value {
                                let value = Owned::new(value).into_shared(guard);
                                let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);

                                unsafe { guard.defer_destroy(now_garbage) };
                                Some(unsafe { value.deref() })
                            } else {
                                removed_node = true;
                                if tree_bin.remove_tree_node(i, guard) {
                                    let linear_bin =
                                        Self::untreeify(tree_bin.arena(guard).iter(), guard);
                                    t.store_bin(bini, linear_bin);
                                    unsafe { TreeBin::defer_drop_without_values(bin, guard) };
                                }
                                unsafe { guard.defer_destroy(current_value) };
                                None
                            }
                        }
                    };
                    drop(bin_lock);
                    break found;
                }
            }
        };
        if removed_node {
            self.add_count(-1, None, guard);
        }
        guard.flush();
        new_val
    }

    /// Removes `key`, returning its value if it had one.
    pub fn remove<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        self.check_guard(guard);
        self.replace_node(key, None, |_| true, guard).map(|(_, v)| v)
    }

    pub fn remove_entry<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<(&'g K, &'g V)> {
        self.check_guard(guard);
        self.replace_node(key, None, |_| true, guard)
    }

    /// Removes `key` if `condition` holds for its current value.
    pub fn remove_if<'g, F>(&'g self, key: &K, condition: F, guard: &'g Guard) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        self.check_guard(guard);
        self.replace_node(key, None, condition, guard).is_some()
    }

    /// Removes `key` if it is mapped to `expected`.
    pub fn remove_if_eq(&self, key: &K, expected: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        self.remove_if(key, |current| current == expected, guard)
    }

    /// Replaces the value of `key` if it has one, returning the old value.
    pub fn replace<'g>(&'g self, key: &K, value: V, guard: &'g Guard) -> Option<&'g V> {
        self.check_guard(guard);
        self.replace_node(key, Some(value), |_| true, guard)
            .map(|(_, v)| v)
    }

    /// Replaces the value of `key` with `value` if `condition` holds for the
    /// current one.
    pub fn replace_if<'g, F>(&'g self, key: &K, condition: F, value: V, guard: &'g Guard) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        self.check_guard(guard);
        self.replace_node(key, Some(value), condition, guard)
            .is_some()
    }

    /// Replaces the value of `key` with `value` if it is mapped to
    /// `expected`.
    pub fn replace_if_eq(&self, key: &K, expected: &V, value: V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        self.replace_if(key, |current| current == expected, value, guard)
    }

    /// Replaces the value of `key` with `new_value`, or removes the entry if
    /// that is `None`, provided `matcher` accepts the current value.
    fn replace_node<'g, M>(
        &'g self,
        key: &K,
        new_value: Option<V>,
        matcher: M,
        guard: &'g Guard,
    ) -> Option<(&'g K, &'g V)>
    where
        M: FnOnce(&V) -> bool,
    {
        let hash = self.hash(key);

        let is_remove = new_value.is_none();
        let mut old_val = None;
        let mut table = self.table.load(Ordering::SeqCst, guard);
        loop {
            if table.is_null() {
                break;
            }

            let t = unsafe { table.deref() };
            if t.is_empty() {
                break;
            }
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                break;
            }

            match *unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Reserved(_) => break,
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut e = bin;
                    let mut pred: Shared<'_, BinEntry<K, V>> = Shared::null();
                    loop {
                        let n = unsafe { chain_node(e) };
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash == hash && self.strategy.equals(&n.key, key) {
                            let ev = n.value.load(Ordering::SeqCst, guard);

                            if matcher(unsafe { ev.deref() }) {
                                old_val = Some((&n.key, ev));

                                if let Some(nv) = new_value {
                                    n.value.store(Owned::new(nv), Ordering::SeqCst);
                                    break;
                                }
                                if !pred.is_null() {
                                    unsafe { chain_node(pred) }
                                        .next
                                        .store(next, Ordering::SeqCst);
                                } else {
                                    t.store_bin(bini, next);
                                }

                                unsafe { guard.defer_destroy(e) };
                            }
                            break;
                        }
                        pred = e;
                        if next.is_null() {
                            break;
                        } else {
                            e = next;
                        }
                    }
                    drop(head_lock);
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();

                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let (i, n) = match tree_bin.find_locked(hash, key, &self.strategy, guard) {
                        Some(found) => found,
                        None => break,
                    };
                    let pv = n.value.load(Ordering::SeqCst, guard);

                    if matcher(unsafe { pv.deref() }) {
                        old_val = Some((&n.key, pv));

                        if let Some(nv) = new_value {
                            n.value.store(Owned::new(nv), Ordering::SeqCst);
                        } else if tree_bin.remove_tree_node(i, guard) {
                            let linear_bin = Self::untreeify(tree_bin.arena(guard).iter(), guard);
                            t.store_bin(bini, linear_bin);
                            unsafe { TreeBin::defer_drop_without_values(bin, guard) };
                        }
                    }

                    drop(bin_lock);
                }
            }
            if let Some((key, val)) = old_val {
                if is_remove {
                    self.add_count(-1, None, guard);
                }

                unsafe { guard.defer_destroy(val) };

                return unsafe { val.as_ref() }.map(move |v| (key, v));
            }
            break;
        }
        None
    }

    /// Keeps only the entries for which `f` returns true.
    ///
    /// An entry whose value changes while `f` looks at it is kept.
    pub fn retain<F>(&self, mut f: F, guard: &Guard)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.check_guard(guard);
        for (k, v) in self.iter(guard) {
            if !f(k, v) {
                self.replace_node(k, None, |current| std::ptr::eq(current, v), guard);
            }
        }
    }
}

impl<K, V, H> PartialEq for HashMap<K, V, H>
where
    V: PartialEq,
    H: HashingStrategy<K>,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.guarded_eq(other, &self.guard(), &other.guard())
    }
}

impl<K, V, H> Eq for HashMap<K, V, H>
where
    V: Eq,
    H: HashingStrategy<K>,
{
}

impl<K, V, H> fmt::Debug for HashMap<K, V, H>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.collector.register().pin();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, H> Drop for HashMap<K, V, H> {
    fn drop(&mut self) {
        // we have &mut self, so no other thread can hold a reference into the map
        let guard = unsafe { crossbeam_epoch::unprotected() };

        assert!(self.next_table.load(Ordering::SeqCst, guard).is_null());
        let table = self.table.swap(Shared::null(), Ordering::SeqCst, guard);
        if table.is_null() {
            return;
        }

        let mut table = unsafe { table.into_owned() }.into_box();
        table.drop_bins();
    }
}

impl<K, V, H> Extend<(K, V)> for &HashMap<K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send,
    H: HashingStrategy<K>,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let iter = iter.into_iter();
        // assume about half of the keys are already present in a non-empty map
        let reserve = if self.is_empty() {
            iter.size_hint().0
        } else {
            (iter.size_hint().0 + 1) / 2
        };

        let guard = self.collector.register().pin();
        self.reserve(reserve, &guard);
        (*self).put_all(iter, &guard);
    }
}

impl<'a, K, V, H> Extend<(&'a K, &'a V)> for &HashMap<K, V, H>
where
    K: 'static + Sync + Send + Copy,
    V: 'static + Sync + Send + Copy,
    H: HashingStrategy<K>,
{
    fn extend<T: IntoIterator<Item = (&'a K, &'a V)>>(&mut self, iter: T) {
        self.extend(iter.into_iter().map(|(&key, &value)| (key, value)));
    }
}

impl<K, V, H> FromIterator<(K, V)> for HashMap<K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send,
    H: HashingStrategy<K> + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut iter = iter.into_iter();

        if let Some((key, value)) = iter.next() {
            let (lower, _) = iter.size_hint();
            let map = HashMap::with_capacity_and_strategy(lower.saturating_add(1), H::default());
            {
                let guard = map.guard();
                map.put(key, value, false, &guard);
                map.put_all(iter, &guard);
            }
            map
        } else {
            Self::default()
        }
    }
}

impl<'a, K, V, H> FromIterator<(&'a K, &'a V)> for HashMap<K, V, H>
where
    K: 'static + Sync + Send + Copy,
    V: 'static + Sync + Send + Copy,
    H: HashingStrategy<K> + Default,
{
    fn from_iter<T: IntoIterator<Item = (&'a K, &'a V)>>(iter: T) -> Self {
        Self::from_iter(iter.into_iter().map(|(&k, &v)| (k, v)))
    }
}

impl<K, V, H> Clone for HashMap<K, V, H>
where
    K: 'static + Sync + Send + Clone,
    V: 'static + Sync + Send + Clone,
    H: HashingStrategy<K> + Clone,
{
    fn clone(&self) -> HashMap<K, V, H> {
        let cloned_map = Self::with_capacity_and_strategy(self.len(), self.strategy.clone());
        {
            let guard = self.collector.register().pin();
            for (k, v) in self.iter(&guard) {
                cloned_map.insert(k.clone(), v.clone(), &guard);
            }
        }
        cloned_map
    }
}

#[inline]
fn num_cpus() -> usize {
    *NCPU
}
