use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt::{self, Debug, Formatter};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Keys whose value has been reclaimed since the last drain.
#[derive(Debug, Default)]
pub(crate) struct ReclaimQueue {
    pending: Mutex<Vec<i32>>,
    next_id: AtomicU64,
}

impl ReclaimQueue {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push(&self, key: i32) {
        self.pending.lock().push(key);
    }

    /// Takes every pending key.
    pub(crate) fn drain(&self) -> Vec<i32> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Vec::new();
        }
        std::mem::take(&mut *pending)
    }
}

/// A key under which one map stored the value.
struct Watcher {
    queue: Weak<ReclaimQueue>,
    key: i32,
}

impl Watcher {
    fn watches(&self, queue: &Arc<ReclaimQueue>, key: i32) -> bool {
        self.key == key && std::ptr::eq(self.queue.as_ptr(), Arc::as_ptr(queue))
    }
}

struct Referent<V> {
    value: V,
    watchers: Mutex<SmallVec<[Watcher; 2]>>,
}

impl<V> Drop for Referent<V> {
    fn drop(&mut self) {
        for watcher in self.watchers.get_mut().drain(..) {
            if let Some(queue) = watcher.queue.upgrade() {
                queue.push(watcher.key);
            }
        }
    }
}

/// A shared handle to a value stored in a [`RefValueMap`](super::RefValueMap).
///
/// The map only keeps a reclaimable reference to the value. Once every
/// `Tracked` handle (and every soft hold) is gone, the value is dropped and
/// the maps that stored it forget the entry on their next update.
pub struct Tracked<V> {
    inner: Arc<Referent<V>>,
}

impl<V> Tracked<V> {
    pub fn new(value: V) -> Self {
        Tracked {
            inner: Arc::new(Referent {
                value,
                watchers: Mutex::new(SmallVec::new()),
            }),
        }
    }

    /// Whether both handles point at the same value.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }

    /// Number of handles and soft holds keeping the value alive.
    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.inner)
    }

    /// Reports `key` to `queue` once the value is dropped. Each key is
    /// reported at most once per queue, however often it is watched.
    pub(crate) fn watch(&self, queue: &Arc<ReclaimQueue>, key: i32) {
        let mut watchers = self.inner.watchers.lock();
        watchers.retain(|w| w.queue.strong_count() > 0);
        if watchers.iter().any(|w| w.watches(queue, key)) {
            return;
        }
        watchers.push(Watcher {
            queue: Arc::downgrade(queue),
            key,
        });
    }
}

impl<V> Clone for Tracked<V> {
    fn clone(&self) -> Self {
        Tracked {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Deref for Tracked<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner.value
    }
}

impl<V: Debug> Debug for Tracked<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.inner.value.fmt(f)
    }
}

impl<V: PartialEq> PartialEq for Tracked<V> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.value == other.inner.value
    }
}

impl<V> From<V> for Tracked<V> {
    fn from(value: V) -> Self {
        Tracked::new(value)
    }
}

/// A reclaimable reference stored as the value of a
/// [`RefValueMap`](super::RefValueMap).
pub trait ValueReference<V>: Send + Sync + 'static {
    /// A reference to `value`, numbered `id`.
    fn new(value: &Tracked<V>, id: u64) -> Self;

    /// The referent, if it is still alive.
    fn get(&self) -> Option<Tracked<V>>;

    fn id(&self) -> u64;

    /// Drops any strong hold on the referent.
    fn release(&self) {}

    /// Whether this reference points at `value`.
    fn refers_to(&self, value: &Tracked<V>) -> bool;
}

/// Reference that never keeps its referent alive.
pub struct WeakValue<V> {
    referent: Weak<Referent<V>>,
    id: u64,
}

impl<V> ValueReference<V> for WeakValue<V>
where
    V: Send + Sync + 'static,
{
    fn new(value: &Tracked<V>, id: u64) -> Self {
        WeakValue {
            referent: Arc::downgrade(&value.inner),
            id,
        }
    }

    fn get(&self) -> Option<Tracked<V>> {
        self.referent.upgrade().map(|inner| Tracked { inner })
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn refers_to(&self, value: &Tracked<V>) -> bool {
        std::ptr::eq(self.referent.as_ptr(), Arc::as_ptr(&value.inner))
    }
}

impl<V> Debug for WeakValue<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakValue")
            .field("id", &self.id)
            .field("alive", &(self.referent.strong_count() > 0))
            .finish()
    }
}

/// Reference that keeps its referent alive until
/// [`release_soft_references`](super::RefValueMap::release_soft_references)
/// is called, and behaves like a [`WeakValue`] afterwards.
pub struct SoftValue<V> {
    weak: WeakValue<V>,
    hold: Mutex<Option<Arc<Referent<V>>>>,
}

impl<V> ValueReference<V> for SoftValue<V>
where
    V: Send + Sync + 'static,
{
    fn new(value: &Tracked<V>, id: u64) -> Self {
        SoftValue {
            weak: WeakValue::new(value, id),
            hold: Mutex::new(Some(value.inner.clone())),
        }
    }

    fn get(&self) -> Option<Tracked<V>> {
        self.weak.get()
    }

    fn id(&self) -> u64 {
        self.weak.id
    }

    fn release(&self) {
        // the referent may drop here, which locks its watchers, never ours
        let hold = self.hold.lock().take();
        drop(hold);
    }

    fn refers_to(&self, value: &Tracked<V>) -> bool {
        self.weak.refers_to(value)
    }
}

impl<V> Debug for SoftValue<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftValue")
            .field("id", &self.weak.id)
            .field("held", &self.hold.lock().is_some())
            .finish()
    }
}
