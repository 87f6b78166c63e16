//! A concurrent hash map specialised for small integer keys.
//!
//! Reads never block. Writers lock only the bin they modify, a resize is
//! carried out cooperatively by every thread that runs into it, and bins with
//! many colliding keys turn into red-black trees. The size is tracked by a
//! striped counter so that concurrent writers do not all hit one word.
//!
//! [`ConcurrentIntObjectMap`] is the main entry point. [`refmap`] wraps it
//! with reclaimable (weak or soft) values, and [`factory`] picks between the
//! map and set flavours.
//!
//! ```
//! use concurrent_intmap::ConcurrentIntObjectMap;
//!
//! let map = ConcurrentIntObjectMap::new();
//! let guard = map.guard();
//! map.insert(7, "seven", &guard);
//! assert_eq!(map.get(&7, &guard), Some(&"seven"));
//! ```
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::type_complexity)]
use crossbeam_epoch::Guard;
use std::ops::Deref;

#[macro_use]
extern crate lazy_static;

mod config;
mod counter;
mod error;
mod map;
mod map_ref;
mod node;
mod raw;
mod set;
mod set_ref;
mod strategy;

/// Iterator types.
pub mod iter;

/// Collection views backed by a map.
pub mod view;

pub mod factory;
pub mod refmap;

pub use config::MapConfig;
pub use error::{Error, Result};
pub use map::{HashMap, TryInsertError};
pub use map_ref::HashMapRef;
pub use set::HashSet;
pub use set_ref::HashSetRef;
pub use strategy::{CanonicalHashing, HashingStrategy, IdentityHashing, IntHashing, IntKey};

/// Default strategy for keys that are neither integers nor identity-keyed.
pub type DefaultHashing = CanonicalHashing<ahash::RandomState>;

/// Map from `i32` keys to values of type `V`.
pub type ConcurrentIntObjectMap<V> = HashMap<i32, V, IntHashing>;

/// Map from `i64` keys to values of type `V`.
pub type ConcurrentLongObjectMap<V> = HashMap<i64, V, IntHashing>;

/// Types needed to safely access shared data concurrently.
pub mod epoch {
    pub use crossbeam_epoch::{pin, Guard};
}

pub(crate) enum GuardRef<'g> {
    Owned(Guard),
    Ref(&'g Guard),
}

impl Deref for GuardRef<'_> {
    type Target = Guard;

    #[inline]
    fn deref(&self) -> &Guard {
        match *self {
            GuardRef::Owned(ref guard) | GuardRef::Ref(&ref guard) => guard,
        }
    }
}
