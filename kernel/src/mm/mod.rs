//! Memory management: boot memory map, physical frame allocation, paging,
//! the kernel heap, the kernel virtual memory manager, and per-process VMAs.
//!
//! Initialization order is fixed and matches the data-flow dependency chain:
//! boot memory map → frame allocator → page tables/PAT → kernel heap →
//! kernel VMM. Each stage is a `static` behind its own mutex, initialized
//! exactly once from [`init`]; there is no lazy initialization at use sites.

use core::sync::atomic::{AtomicU64, Ordering};

pub mod boot_memory_map;
pub mod frame_allocator;
pub mod heap;
pub mod page_table;
pub mod vma;
pub mod vmm;

/// Bytes in a small (4 KiB) physical frame / virtual page.
pub const PAGE_SIZE: usize = 4096;
/// Bytes in a large (2 MiB) page, 512 small frames.
pub const LARGE_PAGE_SIZE: usize = 512 * PAGE_SIZE;

/// Lowest legal user-space address. Page 0 is never mapped so that null
/// pointer dereferences fault.
pub const USERSPACE_START: u64 = 0x0000_0000_0040_0000;
/// One past the highest legal user-space address (exclusive), the
/// conventional x86_64 4-level canonical boundary.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// A physical frame number: a physical address shifted right by
/// `log2(PAGE_SIZE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub const fn from_addr(phys_addr: u64) -> Self {
        Self(phys_addr / PAGE_SIZE as u64)
    }

    pub const fn addr(self) -> u64 {
        self.0 * PAGE_SIZE as u64
    }
}

/// The fixed offset between a physical address and its mapping in the
/// kernel's higher-half window, supplied by the bootloader at entry.
///
/// Populated once in `init()` from `BootInfo.physical_memory_offset`; every
/// other `phys_to_virt`/`virt_to_phys` call in the kernel depends on this
/// invariant holding from that point on.
static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the kernel's physical-memory-offset window. Called once, early
/// in [`init`], before any other `mm` subsystem runs.
pub fn set_phys_mem_offset(offset: u64) {
    PHYS_MEM_OFFSET.store(offset, Ordering::Release);
}

fn phys_mem_offset() -> u64 {
    PHYS_MEM_OFFSET.load(Ordering::Acquire)
}

/// Translate a physical address to its kernel virtual alias.
pub fn phys_to_virt(phys: u64) -> u64 {
    phys + phys_mem_offset()
}

/// Translate a kernel virtual alias back to its physical address.
///
/// # Panics
/// Panics if `virt` lies below the physical memory offset window; callers
/// must only pass addresses obtained from [`phys_to_virt`].
pub fn virt_to_phys(virt: u64) -> u64 {
    virt.checked_sub(phys_mem_offset())
        .expect("virt_to_phys: address below physical memory offset window")
}

/// Run the C1 → C2 → C3 → C4 → C5 initialization sequence.
///
/// `phys_mem_offset` and `memory_regions` come from the bootloader's
/// `BootInfo`; `kernel_phys_start`/`kernel_phys_end` bound the kernel
/// image so the frame allocator can reserve it.
pub fn init(
    phys_mem_offset: u64,
    memory_regions: &bootloader_api::info::MemoryRegions,
    kernel_phys_start: u64,
    kernel_phys_end: u64,
    heap_size: usize,
) {
    set_phys_mem_offset(phys_mem_offset);

    let map = boot_memory_map::BootMemoryMap::from_regions(memory_regions);
    log::info!(
        "mm: {} MiB total, {} MiB conventional",
        map.total_memory() / (1024 * 1024),
        map.total_conventional() / (1024 * 1024)
    );

    frame_allocator::init(&map, kernel_phys_start, kernel_phys_end);
    log::info!("mm: frame allocator ready");

    page_table::init();
    log::info!("mm: page-table engine ready");

    vmm::init();
    heap::init(heap_size);
    log::info!("mm: kernel heap ready ({} KiB)", heap_size / 1024);
}
