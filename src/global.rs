use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::common::PageId;
use crate::modules::system_allocator::MmapSystemAllocator;
use crate::page_heap::{HeapConfig, PageHeap};
use crate::sizeclass_cache::SizeClassCache;
use crate::stats::Stats;

/// Process-wide page heap behind one short-critical-section mutex.
///
/// The size-class cache is shared outside the mutex so the small-object
/// free path can probe it without taking the heap lock; everything else
/// goes through `lock()`.
pub struct GlobalPageHeap {
    inner: Mutex<PageHeap<MmapSystemAllocator>>,
    cache: Arc<SizeClassCache>,
}

static HEAP: OnceLock<GlobalPageHeap> = OnceLock::new();

/// The process-wide heap, created on first use.
pub fn global() -> &'static GlobalPageHeap {
    HEAP.get_or_init(|| {
        let heap = PageHeap::new(MmapSystemAllocator::new(), HeapConfig::default());
        let cache = heap.sizeclass_cache().clone();
        GlobalPageHeap {
            inner: Mutex::new(heap),
            cache,
        }
    })
}

impl GlobalPageHeap {
    /// Takes the heap lock. All mutating operations go through the
    /// returned guard.
    pub fn lock(&self) -> MutexGuard<'_, PageHeap<MmapSystemAllocator>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock-free size-class probe; stale answers are safe because the
    /// cache is advisory.
    pub fn try_get_size_class(&self, p: PageId) -> Option<u32> {
        self.cache.try_get(p)
    }

    /// Authoritative stats snapshot, taken under the lock.
    pub fn stats(&self) -> Stats {
        self.lock().stats()
    }
}

#[cfg(test)]
mod test {
    use super::global;

    #[test]
    fn test_global_heap_round_trip() {
        let heap = global();

        let handle = heap.lock().allocate(2).unwrap();
        let info = heap.lock().span_info(handle);
        assert_eq!(info.length, 2);

        heap.lock().register_size_class(handle, 5);
        // probe without the heap lock
        assert_eq!(heap.try_get_size_class(info.start), Some(5));

        heap.lock().deallocate(handle);
        assert_eq!(heap.try_get_size_class(info.start), None);
        assert!(heap.stats().system_bytes > 0);
        assert!(heap.lock().check_expensive());
    }
}
