use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use log::trace;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;

lazy_static! {
    pub(crate) static ref NCPU: usize = num_cpus::get().max(1);
}

thread_local! {
    static PROBE: Cell<u32> = Cell::new(0);
}

/// The calling thread's probe, seeded randomly on first use.
fn probe() -> u32 {
    PROBE.with(|p| {
        let mut h = p.get();
        if h == 0 {
            h = rand::random::<u32>() | 1;
            p.set(h);
        }
        h
    })
}

/// Moves the calling thread to another cell after a collision.
fn advance_probe(mut h: u32) -> u32 {
    h ^= h << 13;
    h ^= h >> 17;
    h ^= h << 5;
    PROBE.with(|p| p.set(h));
    h
}

type CounterCell = Arc<CachePadded<AtomicIsize>>;

struct Cells {
    slots: Box<[CounterCell]>,
}

impl Cells {
    fn new(n: usize) -> Self {
        Cells {
            slots: (0..n)
                .map(|_| Arc::new(CachePadded::new(AtomicIsize::new(0))))
                .collect(),
        }
    }

    /// Twice as many slots; the existing cells keep their counts.
    fn expand(&self) -> Self {
        let n = self.slots.len();
        Cells {
            slots: self
                .slots
                .iter()
                .cloned()
                .chain((0..n).map(|_| Arc::new(CachePadded::new(AtomicIsize::new(0)))))
                .collect(),
        }
    }

    #[inline]
    fn cell(&self, h: u32) -> &AtomicIsize {
        &self.slots[h as usize & (self.slots.len() - 1)]
    }
}

/// How [`ScalableCounter::add`] absorbed a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Add {
    /// The base counter took it; carries the new base value.
    Base(isize),
    /// A cell took it on the first attempt.
    Cell,
    /// It needed the contended path.
    Contended,
}

/// A size counter that spreads concurrent updates over several cells.
///
/// The total is never stored anywhere: it is the base plus every cell, summed
/// on demand, so a concurrent reader gets an estimate.
pub(crate) struct ScalableCounter {
    base: AtomicIsize,
    busy: AtomicBool,
    cells: Atomic<Cells>,
}

impl std::fmt::Debug for ScalableCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalableCounter")
            .field("base", &self.base.load(Ordering::Relaxed))
            .finish()
    }
}

impl ScalableCounter {
    pub(crate) fn new() -> Self {
        ScalableCounter {
            base: AtomicIsize::new(0),
            busy: AtomicBool::new(false),
            cells: Atomic::null(),
        }
    }

    pub(crate) fn add(&self, x: isize, guard: &Guard) -> Add {
        let cells = self.cells.load(Ordering::Acquire, guard);
        match unsafe { cells.as_ref() } {
            None => {
                let b = self.base.load(Ordering::SeqCst);
                if self
                    .base
                    .compare_exchange(b, b + x, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return Add::Base(b + x);
                }
                self.full_add(x, true, guard);
            }
            Some(table) => {
                let cell = table.cell(probe());
                let v = cell.load(Ordering::SeqCst);
                if cell
                    .compare_exchange(v, v + x, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return Add::Cell;
                }
                self.full_add(x, false, guard);
            }
        }
        Add::Contended
    }

    pub(crate) fn sum(&self, guard: &Guard) -> isize {
        let mut sum = self.base.load(Ordering::SeqCst);
        let cells = self.cells.load(Ordering::Acquire, guard);
        if let Some(table) = unsafe { cells.as_ref() } {
            for cell in table.slots.iter() {
                sum += cell.load(Ordering::SeqCst);
            }
        }
        sum
    }

    fn try_lock(&self) -> bool {
        !self.busy.load(Ordering::Relaxed)
            && self
                .busy
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    fn unlock(&self) {
        self.busy.store(false, Ordering::Release);
    }

    fn full_add(&self, x: isize, mut was_uncontended: bool, guard: &Guard) {
        let mut h = probe();
        let mut collide = false;
        loop {
            let cells = self.cells.load(Ordering::Acquire, guard);
            if let Some(table) = unsafe { cells.as_ref() } {
                let n = table.slots.len();
                if !was_uncontended {
                    // the caller already failed on this cell, rehash first
                    was_uncontended = true;
                } else {
                    let cell = table.cell(h);
                    let v = cell.load(Ordering::SeqCst);
                    if cell
                        .compare_exchange(v, v + x, Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                    {
                        return;
                    }
                    if n >= *NCPU || self.cells.load(Ordering::Acquire, guard) != cells {
                        collide = false;
                    } else if !collide {
                        collide = true;
                    } else if self.try_lock() {
                        if self.cells.load(Ordering::Acquire, guard) == cells {
                            let expanded = Owned::new(table.expand());
                            self.cells.store(expanded, Ordering::Release);
                            // cells are shared with the new table, only the slice goes away
                            unsafe { guard.defer_destroy(cells) };
                            trace!("counter cells expanded to {}", n << 1);
                        }
                        self.unlock();
                        collide = false;
                        continue;
                    }
                }
                h = advance_probe(h);
            } else if self.try_lock() {
                let mut init = false;
                if self.cells.load(Ordering::Acquire, guard).is_null() {
                    let table = Cells::new(2);
                    table.cell(h).fetch_add(x, Ordering::SeqCst);
                    self.cells.store(Owned::new(table), Ordering::Release);
                    init = true;
                }
                self.unlock();
                if init {
                    return;
                }
            } else {
                let b = self.base.load(Ordering::SeqCst);
                if self
                    .base
                    .compare_exchange(b, b + x, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
        }
    }
}

impl Drop for ScalableCounter {
    fn drop(&mut self) {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let cells = self.cells.swap(Shared::null(), Ordering::Relaxed, guard);
        if !cells.is_null() {
            drop(unsafe { cells.into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn uncontended_adds_use_base() {
        let counter = ScalableCounter::new();
        let guard = crossbeam_epoch::pin();
        assert_eq!(counter.add(1, &guard), Add::Base(1));
        assert_eq!(counter.add(4, &guard), Add::Base(5));
        assert_eq!(counter.add(-2, &guard), Add::Base(3));
        assert_eq!(counter.sum(&guard), 3);
    }

    #[test]
    fn contended_adds_are_not_lost() {
        let counter = Arc::new(ScalableCounter::new());
        let threads = 8;
        let per_thread = 10_000;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let counter = counter.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..per_thread {
                        let guard = crossbeam_epoch::pin();
                        // every third thread removes what it adds
                        let x = if t % 3 == 0 && i % 2 == 1 { -1 } else { 1 };
                        counter.add(x, &guard);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let expected: isize = (0..threads)
            .map(|t| if t % 3 == 0 { 0 } else { per_thread as isize })
            .sum();
        assert_eq!(counter.sum(&crossbeam_epoch::pin()), expected);
    }

    #[test]
    fn probe_changes_on_advance() {
        let h = probe();
        assert_ne!(h, 0);
        let next = advance_probe(h);
        assert_ne!(next, h);
        assert_eq!(probe(), next);
    }

    #[test]
    fn expansion_keeps_counts() {
        let table = Cells::new(2);
        table.slots[0].fetch_add(3, Ordering::SeqCst);
        table.slots[1].fetch_add(4, Ordering::SeqCst);
        let bigger = table.expand();
        assert_eq!(bigger.slots.len(), 4);
        let total: isize = bigger.slots.iter().map(|c| c.load(Ordering::SeqCst)).sum();
        assert_eq!(total, 7);
        // the old and new tables share cells
        table.slots[0].fetch_add(1, Ordering::SeqCst);
        assert_eq!(bigger.slots[0].load(Ordering::SeqCst), 4);
    }
}
