use crate::modules::system_allocator::SimSystemAllocator;
use crate::page_heap::{HeapConfig, PageHeap};

mod stress;

fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Heap over the simulated system allocator: 256-page reservation
/// granularity, 64-page holes between reservations.
fn sim_heap() -> PageHeap<SimSystemAllocator> {
    sim_heap_with(SimSystemAllocator::new(), HeapConfig::default())
}

fn sim_heap_with(
    sim: SimSystemAllocator,
    config: HeapConfig,
) -> PageHeap<SimSystemAllocator> {
    init_test_logging();
    PageHeap::new(sim, config)
}
