//! Randomized allocate/deallocate/split/release workload. The point is
//! not any particular end state but that the structural invariants hold
//! after every burst and that the heap folds back together once
//! everything is freed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::sim_heap;
use crate::common::MAX_PAGES;
use crate::span::SpanHandle;
use crate::stats::RangeKind;

#[test]
fn test_randomized_workload_keeps_invariants() {
    let mut heap = sim_heap();
    let mut rng = StdRng::seed_from_u64(0x5EED_CAFE);
    let mut live: Vec<SpanHandle> = Vec::new();

    for step in 0..4000 {
        let action = rng.gen_range(0..100);
        if action < 45 || live.is_empty() {
            // mostly small spans, some large ones
            let n = if rng.gen_bool(0.2) {
                rng.gen_range(MAX_PAGES..MAX_PAGES * 3)
            } else {
                rng.gen_range(1..MAX_PAGES)
            };
            if let Some(handle) = heap.allocate(n) {
                assert_eq!(heap.span_info(handle).length, n);
                live.push(handle);
            }
        } else if action < 80 {
            let index = rng.gen_range(0..live.len());
            let handle = live.swap_remove(index);
            heap.deallocate(handle);
        } else if action < 90 {
            let index = rng.gen_range(0..live.len());
            let handle = live[index];
            let length = heap.span_info(handle).length;
            if length >= 2 {
                let tail = heap.split(handle, rng.gen_range(1..length));
                live.push(tail);
            }
        } else {
            heap.release_at_least(rng.gen_range(1..64));
        }

        if step % 64 == 0 {
            assert!(heap.check_expensive(), "invariants broken at step {}", step);
        }
    }

    assert!(heap.check_expensive());

    for handle in live.drain(..) {
        heap.deallocate(handle);
    }
    assert!(heap.check_expensive());

    // nothing is in use anymore: the free structures carry every page
    let stats = heap.stats();
    assert_eq!(stats.free_bytes + stats.unmapped_bytes, stats.system_bytes);

    // and the range walk sees only free or unmapped memory
    let mut cursor = 0;
    let mut walked_pages = 0u64;
    while let Some(range) = heap.get_next_range(cursor) {
        assert_ne!(range.kind, RangeKind::InUse);
        walked_pages += range.page_count() as u64;
        cursor = range.first_page() + range.page_count();
    }
    assert_eq!(walked_pages, stats.system_bytes >> crate::common::PAGE_SHIFT);
}
