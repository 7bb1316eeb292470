use std::ptr::null_mut;

use libc::{
    c_void, madvise, mmap, mprotect, munmap, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED,
    MAP_NORESERVE, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE, _SC_PAGE_SIZE,
};
use log::warn;

use super::{SysAllocation, SystemAllocatorModule};

/// System allocator backed by `mmap`.
///
/// Reservations are `PROT_NONE` mappings with `MAP_NORESERVE`, so they
/// cost address space only. `commit` flips a range to read/write;
/// `decommit` protects it again and drops the backing with
/// `MADV_DONTNEED`.
pub struct MmapSystemAllocator {
    page_size: usize,
}

impl MmapSystemAllocator {
    pub fn new() -> Self {
        MmapSystemAllocator {
            page_size: unsafe { libc::sysconf(_SC_PAGE_SIZE) as usize },
        }
    }

    fn round_up(&self, bytes: usize) -> usize {
        let granularity = self.page_size;
        (bytes + granularity - 1) & !(granularity - 1)
    }

    unsafe fn map_none(&self, bytes: usize) -> Option<*mut u8> {
        let ptr = mmap(
            null_mut(),
            bytes,
            PROT_NONE,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
            -1,
            0,
        );
        if ptr == MAP_FAILED {
            return None;
        }
        Some(ptr as *mut u8)
    }
}

impl Default for MmapSystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemAllocatorModule for MmapSystemAllocator {
    fn reserve(&mut self, bytes: usize, align: usize) -> Option<SysAllocation> {
        let bytes = self.round_up(bytes);

        if align <= self.page_size {
            // mmap results are already page aligned
            let base = unsafe { self.map_none(bytes)? };
            return Some(SysAllocation {
                base: base as usize,
                actual_bytes: bytes,
            });
        }

        // over-reserve, then trim the unaligned head and the tail back off
        let total = bytes + align - self.page_size;
        let raw = unsafe { self.map_none(total)? } as usize;
        let aligned = (raw + align - 1) & !(align - 1);
        let head = aligned - raw;
        let tail = total - head - bytes;
        unsafe {
            if head > 0 {
                munmap(raw as *mut c_void, head);
            }
            if tail > 0 {
                munmap((aligned + bytes) as *mut c_void, tail);
            }
        }
        Some(SysAllocation {
            base: aligned,
            actual_bytes: bytes,
        })
    }

    fn commit(&mut self, base: usize, bytes: usize) -> Result<(), ()> {
        let code = unsafe { mprotect(base as *mut c_void, bytes, PROT_READ | PROT_WRITE) };
        if code != 0 {
            return Err(());
        }
        Ok(())
    }

    fn decommit(&mut self, base: usize, bytes: usize) -> Result<(), ()> {
        unsafe {
            if mprotect(base as *mut c_void, bytes, PROT_NONE) != 0 {
                return Err(());
            }
            if madvise(base as *mut c_void, bytes, MADV_DONTNEED) != 0 {
                // keep the range usable if the backing could not be dropped
                mprotect(base as *mut c_void, bytes, PROT_READ | PROT_WRITE);
                return Err(());
            }
        }
        Ok(())
    }

    fn release(&mut self, base: usize, bytes: usize) {
        let code = unsafe { munmap(base as *mut c_void, bytes) };
        if code != 0 {
            warn!("could not unmap {} bytes at {:#x}", bytes, base);
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
