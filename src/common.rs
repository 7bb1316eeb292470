/// Number of an aligned page in virtual address space.
/// The page's first byte lives at `id << PAGE_SHIFT`.
pub type PageId = usize;

/// A page count.
pub type Length = usize;

/// log2 of the page size managed by the heap.
pub const PAGE_SHIFT: usize = 12;

/// Size in bytes of one heap page.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Virtual address width the pagemap has to cover.
pub const ADDRESS_BITS: usize = 48;

/// Bits of a page id.
pub const PAGE_ID_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;

/// Spans shorter than this live on the per-length free lists,
/// everything of this length and up in the ordered large sets.
pub const MAX_PAGES: Length = 128;

/// Minimum number of pages fetched from the system per growth. Kept at a
/// whole large span so system calls amortize and every fresh reservation
/// enters the large returned set.
pub const MIN_SYSTEM_ALLOC: Length = MAX_PAGES;

/// Once system bytes cross this, pagemap interior nodes are preallocated
/// in one pass instead of growing piecemeal.
pub const PAGEMAP_BIG_ALLOCATION_THRESHOLD: usize = 128 << 20;

/// Pages to deallocate before the next scavenger attempt, after an
/// attempt that released something.
pub const DEFAULT_RELEASE_DELAY: i64 = 1 << 18;

/// Back-off used when an attempt released nothing.
pub const MAX_RELEASE_DELAY: i64 = 1 << 20;

pub(crate) fn pages_to_bytes(n: Length) -> u64 {
    (n as u64) << PAGE_SHIFT
}
