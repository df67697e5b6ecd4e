//! Kernel virtual memory manager.
//!
//! A thin layer over the frame allocator and page-table engine: tracks which
//! pages of the kernel's higher-half window are in use with a second flat
//! bitmap (distinct from the physical frame bitmap in [`super::frame_allocator`]),
//! so callers don't have to walk page tables to find free virtual space.

use bitflags::bitflags;
use spin::Mutex;

use super::page_table::{self, PageFlags};
use super::{frame_allocator, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Base of the region the kernel VMM manages: heap, MMIO mappings, and any
/// other kernel-only virtual allocation. Distinct from the direct physical
/// mapping window used by [`super::phys_to_virt`].
const KERNEL_VMM_BASE: u64 = 0xffff_ff00_0000_0000;
/// Size of the managed window: 64 GiB of address space, tracked one bit per
/// page (a 2 MiB bitmap) — cheap enough to keep resident for the kernel's
/// entire lifetime.
const KERNEL_VMM_PAGES: u64 = (64 * 1024 * 1024 * 1024) / PAGE_SIZE as u64;

bitflags! {
    /// Protection/caching intent for a kernel virtual mapping, translated to
    /// [`PageFlags`] at map time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        const WRITABLE     = 1 << 0;
        const EXECUTABLE   = 1 << 1;
        const UNCACHEABLE  = 1 << 2;
    }
}

impl MappingFlags {
    /// Read-write, non-executable, normally-cached: ordinary kernel data
    /// (the heap, kernel stacks, dynamically-mapped bookkeeping structures).
    pub const KERNEL_DATA: Self = Self::WRITABLE;
    /// Device memory: read-write, uncacheable.
    pub const KERNEL_MMIO: Self = Self::from_bits_truncate(Self::WRITABLE.bits() | Self::UNCACHEABLE.bits());

    fn to_page_flags(self) -> PageFlags {
        let mut flags = PageFlags::PRESENT | PageFlags::GLOBAL;
        if self.contains(Self::WRITABLE) {
            flags |= PageFlags::RW;
        }
        if !self.contains(Self::EXECUTABLE) {
            flags |= PageFlags::NX;
        }
        if self.contains(Self::UNCACHEABLE) {
            flags |= PageFlags::PCD;
        }
        flags
    }
}

struct VirtualBitmap {
    words: [u64; (KERNEL_VMM_PAGES / 64) as usize],
    next_free_hint: u64,
}

impl VirtualBitmap {
    const fn new() -> Self {
        Self {
            words: [0; (KERNEL_VMM_PAGES / 64) as usize],
            next_free_hint: 0,
        }
    }

    fn is_used(&self, page: u64) -> bool {
        self.words[(page / 64) as usize] & (1 << (page % 64)) != 0
    }

    fn set_used(&mut self, page: u64) {
        self.words[(page / 64) as usize] |= 1 << (page % 64);
    }

    fn set_free(&mut self, page: u64) {
        self.words[(page / 64) as usize] &= !(1 << (page % 64));
    }

    fn find_run(&self, n: u64) -> Option<u64> {
        let mut start = self.next_free_hint;
        'outer: while start + n <= KERNEL_VMM_PAGES {
            for i in 0..n {
                if self.is_used(start + i) {
                    start += i + 1;
                    continue 'outer;
                }
            }
            return Some(start);
        }
        if self.next_free_hint != 0 {
            let mut start = 0u64;
            'outer2: while start + n <= self.next_free_hint {
                for i in 0..n {
                    if self.is_used(start + i) {
                        start += i + 1;
                        continue 'outer2;
                    }
                }
                return Some(start);
            }
        }
        None
    }
}

static VIRTUAL_BITMAP: Mutex<VirtualBitmap> = Mutex::new(VirtualBitmap::new());

pub fn init() {}

/// Reserve `n` contiguous pages in the kernel's managed virtual window, back
/// each with a freshly allocated physical frame, and map it with `flags`.
/// Returns the base virtual address.
pub fn alloc_virtual_pages(n: usize, flags: MappingFlags) -> KernelResult<u64> {
    let n = n as u64;
    let start_page = {
        let mut bitmap = VIRTUAL_BITMAP.lock();
        let start = bitmap.find_run(n).ok_or(KernelError::OutOfMemory {
            requested: (n as usize) * PAGE_SIZE,
            available: 0,
        })?;
        for page in start..start + n {
            bitmap.set_used(page);
        }
        bitmap.next_free_hint = start + n;
        start
    };
    let base = KERNEL_VMM_BASE + start_page * PAGE_SIZE as u64;
    let root = page_table::current_page_table();
    let page_flags = flags.to_page_flags();

    for i in 0..n {
        let frame = match frame_allocator::alloc_page() {
            Ok(frame) => frame,
            Err(e) => {
                // Roll back every frame and mapping already installed for
                // this request before surfacing the failure.
                unmap_virtual_pages(base, i as usize);
                let mut bitmap = VIRTUAL_BITMAP.lock();
                for page in start_page..start_page + n {
                    bitmap.set_free(page);
                }
                return Err(e);
            }
        };
        let virt = base + i * PAGE_SIZE as u64;
        page_table::map_page(virt, frame.addr(), page_flags, root)?;
        tlb::flush_address(virt);
    }
    Ok(base)
}

/// Map `n` pages starting at `virt` onto the contiguous physical range
/// starting at `phys`, without allocating frames. Used for MMIO and other
/// fixed-physical-address mappings.
pub fn map_contiguous_physical_pages(
    virt: u64,
    phys: u64,
    n: usize,
    flags: MappingFlags,
) -> KernelResult<()> {
    let root = page_table::current_page_table();
    let page_flags = flags.to_page_flags();
    for i in 0..n as u64 {
        page_table::map_page(
            virt + i * PAGE_SIZE as u64,
            phys + i * PAGE_SIZE as u64,
            page_flags,
            root,
        )?;
        tlb::flush_address(virt + i * PAGE_SIZE as u64);
    }
    Ok(())
}

/// Unmap `n` pages starting at `virt`, free the frames backing them, and
/// release the virtual range back to the bitmap if it falls inside the
/// managed window.
pub fn unmap_virtual_pages(virt: u64, n: usize) {
    let root = page_table::current_page_table();
    for i in 0..n as u64 {
        let addr = virt + i * PAGE_SIZE as u64;
        if let Ok(frame) = page_table::unmap_page(addr, root) {
            frame_allocator::free_page(frame);
        }
        tlb::flush_address(addr);
    }
    if virt >= KERNEL_VMM_BASE {
        let start_page = (virt - KERNEL_VMM_BASE) / PAGE_SIZE as u64;
        let mut bitmap = VIRTUAL_BITMAP.lock();
        for page in start_page..start_page + n as u64 {
            bitmap.set_free(page);
        }
        if start_page < bitmap.next_free_hint {
            bitmap.next_free_hint = start_page;
        }
    }
}

/// TLB flush helpers, kept as a nested module so call sites read as
/// `vmm::tlb::flush_address(...)` rather than bare free functions.
pub mod tlb {
    use crate::mm::page_table;

    pub fn flush_address(virt: u64) {
        page_table::flush_tlb_page(virt);
    }

    pub fn flush_all() {
        page_table::flush_tlb_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_finds_and_releases_runs() {
        let mut bitmap = VirtualBitmap::new();
        let start = bitmap.find_run(4).unwrap();
        assert_eq!(start, 0);
        for page in start..start + 4 {
            bitmap.set_used(page);
        }
        let next = bitmap.find_run(4).unwrap();
        assert_eq!(next, 4);
        for page in start..start + 4 {
            bitmap.set_free(page);
        }
        assert!(!bitmap.is_used(start));
    }
}
