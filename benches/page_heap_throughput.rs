use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use span_heap::modules::system_allocator::SimSystemAllocator;
use span_heap::{HeapConfig, PageHeap};

const OPS: u64 = 10_000;

/// allocate/deallocate pairs of a fixed span size. The simulated system
/// allocator keeps syscalls out of the measurement, so this times the
/// free-structure and coalescing bookkeeping alone.
fn allocate_free(heap: &mut PageHeap<SimSystemAllocator>, pages: usize) {
    for _ in 0..OPS {
        let span = heap.allocate(pages).unwrap();
        black_box(span);
        heap.deallocate(span);
    }
}

fn benchmark_page_heap_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_heap_throughput");

    // 127 is the last small length, 128 the first large one
    for pages in [1usize, 4, 32, 127, 128, 512] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(
            BenchmarkId::new("allocate_free", pages),
            &pages,
            |b, &pages| {
                let mut heap = PageHeap::new(SimSystemAllocator::new(), HeapConfig::default());
                b.iter(|| allocate_free(&mut heap, pages));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_page_heap_throughput);
criterion_main!(benches);
