use std::cmp::Ordering;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

/// Decides how a map hashes, compares and orders its keys.
///
/// `compare` must be a total order that agrees with `equals`: two keys are
/// equal exactly when they compare as `Ordering::Equal`. Tree bins rely on it
/// to order keys whose hashes collide.
pub trait HashingStrategy<K: ?Sized> {
    fn hash(&self, key: &K) -> u64;

    fn equals(&self, a: &K, b: &K) -> bool;

    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Fixed-width integer usable as a key with [`IntHashing`].
pub trait IntKey: Copy + Ord {
    /// The raw bit pattern of the key.
    fn bits(self) -> u64;
}

macro_rules! int_key {
    ($($t:ty => $u:ty),*) => {
        $(
            impl IntKey for $t {
                #[inline]
                fn bits(self) -> u64 {
                    self as $u as u64
                }
            }
        )*
    };
}

int_key!(i8 => u8, u8 => u8, i16 => u16, u16 => u16, i32 => u32, u32 => u32,
         i64 => u64, u64 => u64, isize => usize, usize => usize);

/// Integer keys, hashed by their bit pattern and compared by value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntHashing;

impl<K: IntKey> HashingStrategy<K> for IntHashing {
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        key.bits()
    }

    #[inline]
    fn equals(&self, a: &K, b: &K) -> bool {
        a == b
    }

    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Keys compared with their own `Eq`/`Ord` and hashed through `S`.
#[derive(Debug, Default, Clone)]
pub struct CanonicalHashing<S = ahash::RandomState> {
    build_hasher: S,
}

impl<S> CanonicalHashing<S> {
    pub fn with_hasher(build_hasher: S) -> Self {
        CanonicalHashing { build_hasher }
    }
}

impl<K, S> HashingStrategy<K> for CanonicalHashing<S>
where
    K: ?Sized + Hash + Ord,
    S: BuildHasher,
{
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        let mut h = self.build_hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    #[inline]
    fn equals(&self, a: &K, b: &K) -> bool {
        a == b
    }

    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Shared keys told apart by address rather than by content.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IdentityHashing;

impl IdentityHashing {
    #[inline]
    fn address<T: ?Sized>(key: &Arc<T>) -> usize {
        Arc::as_ptr(key) as *const () as usize
    }
}

impl<T: ?Sized> HashingStrategy<Arc<T>> for IdentityHashing {
    #[inline]
    fn hash(&self, key: &Arc<T>) -> u64 {
        // allocations are at least word aligned, so the low bits carry nothing
        (Self::address(key) >> 3) as u64
    }

    #[inline]
    fn equals(&self, a: &Arc<T>, b: &Arc<T>) -> bool {
        Self::address(a) == Self::address(b)
    }

    #[inline]
    fn compare(&self, a: &Arc<T>, b: &Arc<T>) -> Ordering {
        Self::address(a).cmp(&Self::address(b))
    }
}

/// Folds a 64-bit hash into the 32 bits used for bin selection, mixing the
/// high half into the low one so that keys differing only in their upper
/// bits do not all land in the same bin.
#[inline]
pub(crate) fn spread(h: u64) -> u64 {
    let h = (h ^ (h >> 32)) as u32;
    u64::from(h ^ (h >> 16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_mixes_high_bits() {
        // keys that only differ above the mask must land in different bins
        let mask = 15;
        assert_ne!(spread(1 << 16) & mask, spread(2 << 16) & mask);
        assert_eq!(spread(5), 5);
        assert!(spread(u64::MAX) <= u64::from(u32::MAX));
    }

    #[test]
    fn int_keys_hash_their_bits() {
        assert_eq!(HashingStrategy::<i32>::hash(&IntHashing, &-1), 0xffff_ffff);
        assert_eq!(HashingStrategy::<u8>::hash(&IntHashing, &7), 7);
        assert_eq!(
            HashingStrategy::<i64>::hash(&IntHashing, &-2),
            0xffff_ffff_ffff_fffe
        );
        assert_eq!(IntHashing.compare(&-3i32, &2), Ordering::Less);
    }

    #[test]
    fn identity_ignores_contents() {
        let a = Arc::new(String::from("x"));
        let b = Arc::new(String::from("x"));
        assert!(!IdentityHashing.equals(&a, &b));
        assert!(IdentityHashing.equals(&a, &a.clone()));
        assert_ne!(IdentityHashing.compare(&a, &b), Ordering::Equal);
    }

    #[test]
    fn canonical_agrees_with_eq() {
        let s = CanonicalHashing::<ahash::RandomState>::default();
        assert!(s.equals("abc", "abc"));
        assert_eq!(s.hash("abc"), s.hash("abc"));
        assert_eq!(s.compare("abc", "abd"), Ordering::Less);
    }
}
