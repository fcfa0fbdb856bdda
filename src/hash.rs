//! Zero-sized hash builder and ordered collection aliases for internal records.
//!
//! Store records, change-sets and task records are all keyed by short strings
//! and never exposed to untrusted input, so HashDoS resistance is not a
//! concern. Ordering matters for deterministic notifications, which is why the
//! aliases are built on `indexmap` rather than `std` collections.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};
use indexmap::{IndexMap, IndexSet};

/// A zero-sized BuildHasher that uses foldhash with a fixed seed.
///
/// All instances produce identical hash values, so two records built
/// independently iterate and compare the same way.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x517cc1b727220a95).build_hasher()
    }
}

/// Insertion-ordered map using [`FastHashBuilder`].
pub type FastIndexMap<K, V> = IndexMap<K, V, FastHashBuilder>;

/// Insertion-ordered set using [`FastHashBuilder`].
pub type FastIndexSet<T> = IndexSet<T, FastHashBuilder>;
