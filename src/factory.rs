//! Constructors that pick a map or set flavour.
//!
//! Keys are either compared by value through an explicit
//! [`HashingStrategy`], or by identity for shared (`Arc`) keys.

use crate::config::MapConfig;
use crate::error::Result;
use crate::refmap::{SoftValueMap, WeakValueMap};
use crate::strategy::{HashingStrategy, IdentityHashing};
use crate::{ConcurrentIntObjectMap, ConcurrentLongObjectMap, HashMap, HashSet};
use std::sync::Arc;

/// A map that hashes and compares keys through `strategy`.
pub fn create_map<K, V, H>(strategy: H) -> HashMap<K, V, H>
where
    H: HashingStrategy<K>,
{
    HashMap::with_strategy(strategy)
}

/// A map whose `Arc` keys are equal only if they are the same allocation.
pub fn create_identity_map<T: ?Sized, V>() -> HashMap<Arc<T>, V, IdentityHashing> {
    HashMap::with_strategy(IdentityHashing)
}

pub fn create_set<T, H>(strategy: H) -> HashSet<T, H>
where
    H: HashingStrategy<T>,
{
    HashSet::with_strategy(strategy)
}

pub fn create_identity_set<T: ?Sized>() -> HashSet<Arc<T>, IdentityHashing> {
    HashSet::with_strategy(IdentityHashing)
}

pub fn create_concurrent_int_object_map<V>() -> ConcurrentIntObjectMap<V> {
    ConcurrentIntObjectMap::new()
}

pub fn create_concurrent_int_object_map_with_config<V>(
    config: MapConfig,
) -> Result<ConcurrentIntObjectMap<V>> {
    ConcurrentIntObjectMap::with_config(config)
}

pub fn create_concurrent_long_object_map<V>() -> ConcurrentLongObjectMap<V> {
    ConcurrentLongObjectMap::new()
}

/// An `i32`-keyed map that does not keep its values alive.
pub fn create_int_key_weak_value_map<V>() -> WeakValueMap<V> {
    WeakValueMap::new()
}

/// An `i32`-keyed map that keeps its values alive until told to let go.
pub fn create_int_key_soft_value_map<V>() -> SoftValueMap<V> {
    SoftValueMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refmap::Tracked;
    use crate::CanonicalHashing;

    #[test]
    fn identity_and_canonical_maps_differ() {
        let a: Arc<str> = Arc::from("k");
        let b: Arc<str> = Arc::from("k");

        let identity = create_identity_map::<str, i32>();
        let guard = identity.guard();
        identity.insert(a.clone(), 1, &guard);
        identity.insert(b.clone(), 2, &guard);
        assert_eq!(identity.len(), 2);

        let canonical =
            create_map::<Arc<str>, i32, _>(CanonicalHashing::<ahash::RandomState>::default());
        canonical.insert(a, 1, &guard);
        canonical.insert(b, 2, &guard);
        assert_eq!(canonical.len(), 1);
    }

    #[test]
    fn config_errors_surface() {
        let bad = MapConfig::default().concurrency_level(0);
        assert!(create_concurrent_int_object_map_with_config::<u8>(bad).is_err());
        let good = MapConfig::with_capacity(10);
        assert!(create_concurrent_int_object_map_with_config::<u8>(good).is_ok());
    }

    #[test]
    fn reference_maps() {
        let weak = create_int_key_weak_value_map();
        let soft = create_int_key_soft_value_map();
        weak.put(1, &Tracked::new(1));
        soft.put(1, &Tracked::new(1));
        assert!(weak.get(1).is_none());
        assert_eq!(soft.get(1).as_deref(), Some(&1));
    }

    #[test]
    fn sets() {
        let set = create_identity_set::<i32>();
        let guard = set.guard();
        let one = Arc::new(1);
        assert!(set.insert(one.clone(), &guard));
        assert!(set.insert(Arc::new(1), &guard));
        assert!(set.contains(&one, &guard));
        assert_eq!(set.len(), 2);

        let set = create_set(crate::IntHashing);
        set.insert(1u16, &guard);
        assert!(set.contains(&1, &guard));
        assert_eq!(create_concurrent_long_object_map::<()>().len(), 0);
    }
}
