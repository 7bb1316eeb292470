//! Packed direct-mapped cache from page id to size class.
//!
//! The small-object free path only needs the size class of a page, not
//! the whole descriptor, so the hot lookup goes through this cache and
//! falls back to the pagemap on a miss. Entries pack the upper key bits
//! next to the value in one `AtomicU32`, which makes probes lock-free;
//! the cache is advisory and a stale entry is always safe to act on
//! because writers invalidate before a page changes meaning.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::common::{PageId, PAGE_ID_BITS};

const HASH_BITS: usize = 16;
const LEN: usize = 1 << HASH_BITS;
const VALUE_BITS: usize = 8;
const VALUE_MASK: u32 = (1 << VALUE_BITS) - 1;
const TAG_MASK: u32 = (1 << (PAGE_ID_BITS - HASH_BITS)) - 1;

/// Largest size class the packed entries can carry.
pub const MAX_SIZE_CLASS: u32 = VALUE_MASK;

pub struct SizeClassCache {
    entries: Box<[AtomicU32]>,
}

impl SizeClassCache {
    pub(crate) fn new() -> Self {
        let mut entries = Vec::new();
        entries.resize_with(LEN, || AtomicU32::new(0));
        SizeClassCache {
            entries: entries.into_boxed_slice(),
        }
    }

    fn slot(p: PageId) -> usize {
        p & (LEN - 1)
    }

    fn tag(p: PageId) -> u32 {
        ((p >> HASH_BITS) as u32) & TAG_MASK
    }

    /// Lock-free probe. `None` on a slot holding another page or on an
    /// invalidated entry; callers fall back to the pagemap.
    pub fn try_get(&self, p: PageId) -> Option<u32> {
        let entry = self.entries[Self::slot(p)].load(Ordering::Acquire);
        if entry >> VALUE_BITS != Self::tag(p) {
            return None;
        }
        let value = entry & VALUE_MASK;
        (value != 0).then_some(value)
    }

    /// Publishes `sizeclass` for `p`. Size class 0 is the absent
    /// sentinel and must never be stored.
    pub(crate) fn put(&self, p: PageId, sizeclass: u32) {
        debug_assert!(sizeclass != 0 && sizeclass <= MAX_SIZE_CLASS);
        let entry = (Self::tag(p) << VALUE_BITS) | sizeclass;
        self.entries[Self::slot(p)].store(entry, Ordering::Release);
    }

    /// Drops whatever the slot says about `p`; other pages hashing here
    /// are dropped along with it, which is fine for an advisory cache.
    pub(crate) fn invalidate(&self, p: PageId) {
        self.entries[Self::slot(p)].store(Self::tag(p) << VALUE_BITS, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::{SizeClassCache, LEN, MAX_SIZE_CLASS};

    #[test]
    fn test_put_get_invalidate() {
        let cache = SizeClassCache::new();

        assert_eq!(cache.try_get(0), None);
        assert_eq!(cache.try_get(42), None);

        cache.put(42, 7);
        assert_eq!(cache.try_get(42), Some(7));

        cache.invalidate(42);
        assert_eq!(cache.try_get(42), None);
    }

    #[test]
    fn test_colliding_pages_miss() {
        let cache = SizeClassCache::new();

        // both pages land in the same slot but carry different tags
        let a = 42;
        let b = 42 + LEN;
        cache.put(a, 3);
        assert_eq!(cache.try_get(a), Some(3));
        assert_eq!(cache.try_get(b), None);

        // the newer page evicts the older one
        cache.put(b, MAX_SIZE_CLASS);
        assert_eq!(cache.try_get(b), Some(MAX_SIZE_CLASS));
        assert_eq!(cache.try_get(a), None);
    }
}
