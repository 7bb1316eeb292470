#[cfg(feature = "use_libc")]
pub mod mmap;
pub mod sim;

#[cfg(feature = "use_libc")]
pub use mmap::MmapSystemAllocator;
pub use sim::SimSystemAllocator;

/// One reservation handed back by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysAllocation {
    /// First byte of the range; aligned as requested.
    pub base: usize,
    /// Bytes actually reserved, at least the request.
    pub actual_bytes: usize,
}

/// A module that hands raw address ranges to the page heap
/// (e.g. through `mmap`).
///
/// Ranges come back *reserved but decommitted*: the addresses are owned
/// by the caller, physical backing only appears after `commit`.
pub trait SystemAllocatorModule {
    /// Reserves at least `bytes` of address space aligned to `align`
    /// (a power of two). The result may be larger than asked.
    fn reserve(&mut self, bytes: usize, align: usize) -> Option<SysAllocation>;

    /// Backs `[base, base + bytes)` with physical memory.
    fn commit(&mut self, base: usize, bytes: usize) -> Result<(), ()>;

    /// Drops the physical backing of `[base, base + bytes)` while
    /// keeping the address range reserved.
    fn decommit(&mut self, base: usize, bytes: usize) -> Result<(), ()>;

    /// Gives a reservation back to the system. Advisory: a platform
    /// without a real release may keep the range.
    fn release(&mut self, base: usize, bytes: usize);

    /// Page granularity of this allocator.
    fn page_size(&self) -> usize;
}
