//! Physical page-frame bitmap allocator.
//!
//! One bit per 4 KiB frame; bit set means in use. The whole bitmap is
//! protected by a single mutex — fine-grained locking is a non-goal here.

use alloc::vec::Vec;

use spin::Mutex;

use super::boot_memory_map::{BootMemoryMap, RegionKind};
use super::{FrameNumber, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Physical pages reserved for the AP trampoline protocol (`0x6000` up to
/// 20 pages), independent of whatever the kernel image or bitmap occupy.
const AP_TRAMPOLINE_BASE: u64 = 0x6000;
const AP_TRAMPOLINE_PAGES: u64 = 20;

struct Bitmap {
    words: Vec<u64>,
    total_frames: u64,
    next_free_hint: u64,
}

impl Bitmap {
    fn new(total_frames: u64) -> Self {
        let word_count = (total_frames as usize).div_ceil(64);
        Self {
            words: alloc::vec![u64::MAX; word_count],
            total_frames,
            next_free_hint: 0,
        }
    }

    fn set_used(&mut self, pfn: u64) {
        if pfn >= self.total_frames {
            return;
        }
        self.words[(pfn / 64) as usize] |= 1 << (pfn % 64);
    }

    fn set_free(&mut self, pfn: u64) {
        if pfn >= self.total_frames {
            return;
        }
        self.words[(pfn / 64) as usize] &= !(1 << (pfn % 64));
    }

    fn is_used(&self, pfn: u64) -> bool {
        if pfn >= self.total_frames {
            return true;
        }
        self.words[(pfn / 64) as usize] & (1 << (pfn % 64)) != 0
    }

    fn find_run(&self, n: u64, align_frames: u64) -> Option<u64> {
        let mut start = self.next_free_hint;
        while start % align_frames != 0 {
            start += 1;
        }
        'outer: while start + n <= self.total_frames {
            for i in 0..n {
                if self.is_used(start + i) {
                    start += i + 1;
                    while start % align_frames != 0 {
                        start += 1;
                    }
                    continue 'outer;
                }
            }
            return Some(start);
        }
        // Wrapped search from the bottom, in case next_free_hint is stale
        // and past the only remaining run.
        if self.next_free_hint != 0 {
            let mut start = 0u64;
            while start % align_frames != 0 {
                start += 1;
            }
            'outer2: while start + n <= self.next_free_hint {
                for i in 0..n {
                    if self.is_used(start + i) {
                        start += i + 1;
                        while start % align_frames != 0 {
                            start += 1;
                        }
                        continue 'outer2;
                    }
                }
                return Some(start);
            }
        }
        None
    }
}

/// Page-frame bitmap allocator. Owns every physical 4 KiB frame in the
/// system once [`init`] runs.
pub struct FrameAllocator {
    bitmap: Mutex<Bitmap>,
}

static FRAME_ALLOCATOR: Mutex<Option<FrameAllocator>> = Mutex::new(None);

/// Build the bitmap from the boot memory map and reserve the frames the
/// kernel image, the bitmap itself, and the AP trampoline region occupy.
pub fn init(map: &BootMemoryMap, kernel_phys_start: u64, kernel_phys_end: u64) {
    let total_frames = map.highest_address().div_ceil(PAGE_SIZE as u64);
    let mut bitmap = Bitmap::new(total_frames);

    // Start all-used (constructor default), then free every conventional
    // range reported by firmware.
    for entry in map.entries() {
        if entry.kind != RegionKind::Conventional {
            continue;
        }
        let first_pfn = entry.base.div_ceil(PAGE_SIZE as u64);
        let last_pfn = (entry.base + entry.length) / PAGE_SIZE as u64;
        for pfn in first_pfn..last_pfn {
            bitmap.set_free(pfn);
        }
    }

    // Re-lock the kernel image.
    lock_range(&mut bitmap, kernel_phys_start, kernel_phys_end);

    // Re-lock the bitmap's own backing frames. The bitmap's Vec lives on
    // the not-yet-initialized kernel heap during this call, so this is a
    // bookkeeping reservation of the *future* canonical placement, not the
    // scratch allocation used to build the Vec during boot.
    let bitmap_bytes = (total_frames as usize).div_ceil(8);
    if let Some(region) = map.find_segment(kernel_phys_end, u64::MAX, bitmap_bytes as u64) {
        lock_range(&mut bitmap, region.base, region.base + bitmap_bytes as u64);
    }

    // Re-lock the AP trampoline reservation and the fixed addresses the AP
    // startup protocol writes to directly.
    lock_range(
        &mut bitmap,
        AP_TRAMPOLINE_BASE,
        AP_TRAMPOLINE_BASE + AP_TRAMPOLINE_PAGES * PAGE_SIZE as u64,
    );
    for fixed in [0x8000u64, 0x9000, 0x11000, 0x15000] {
        lock_range(&mut bitmap, fixed, fixed + PAGE_SIZE as u64);
    }
    lock_range(&mut bitmap, 0x18000, 0x70000);

    bitmap.next_free_hint = (0..total_frames).find(|&pfn| !bitmap.is_used(pfn)).unwrap_or(0);

    *FRAME_ALLOCATOR.lock() = Some(FrameAllocator {
        bitmap: Mutex::new(bitmap),
    });
}

fn lock_range(bitmap: &mut Bitmap, start: u64, end: u64) {
    let first_pfn = start / PAGE_SIZE as u64;
    let last_pfn = end.div_ceil(PAGE_SIZE as u64);
    for pfn in first_pfn..last_pfn {
        bitmap.set_used(pfn);
    }
}

fn with_allocator<R>(f: impl FnOnce(&FrameAllocator) -> R) -> KernelResult<R> {
    let guard = FRAME_ALLOCATOR.lock();
    guard
        .as_ref()
        .map(f)
        .ok_or(KernelError::NotInitialized { subsystem: "frame_allocator" })
}

/// Allocate a single free frame.
pub fn alloc_page() -> KernelResult<FrameNumber> {
    alloc_pages(1)
}

/// Allocate `n` contiguous free frames.
pub fn alloc_pages(n: u64) -> KernelResult<FrameNumber> {
    alloc_pages_aligned(n, PAGE_SIZE as u64)
}

/// Allocate `n` contiguous free frames whose base physical address is a
/// multiple of `align` (a power of two, at least `PAGE_SIZE`).
pub fn alloc_pages_aligned(n: u64, align: u64) -> KernelResult<FrameNumber> {
    debug_assert!(align.is_power_of_two() && align >= PAGE_SIZE as u64);
    let align_frames = align / PAGE_SIZE as u64;
    with_allocator(|alloc| {
        let mut bitmap = alloc.bitmap.lock();
        let start = bitmap.find_run(n, align_frames).ok_or(KernelError::OutOfMemory {
            requested: (n as usize) * PAGE_SIZE,
            available: 0,
        })?;
        for pfn in start..start + n {
            bitmap.set_used(pfn);
        }
        bitmap.next_free_hint = start + n;
        Ok(FrameNumber(start))
    })?
}

/// A `alloc_pages_aligned(512, 2 MiB)` specialization.
pub fn alloc_large_page() -> KernelResult<FrameNumber> {
    alloc_pages_aligned(512, super::LARGE_PAGE_SIZE as u64)
}

/// Free a single frame. Idempotent: freeing an already-free frame is a
/// no-op.
pub fn free_page(frame: FrameNumber) {
    free_pages(frame, 1);
}

/// Free `n` contiguous frames starting at `frame`. Idempotent.
pub fn free_pages(frame: FrameNumber, n: u64) {
    let _ = with_allocator(|alloc| {
        let mut bitmap = alloc.bitmap.lock();
        for pfn in frame.0..frame.0 + n {
            bitmap.set_free(pfn);
        }
        if frame.0 < bitmap.next_free_hint {
            bitmap.next_free_hint = frame.0;
        }
    });
}

/// Mark a frame used without going through the allocation path, for
/// reserving known regions. Idempotent.
pub fn lock_page(frame: FrameNumber) {
    lock_pages(frame, 1);
}

/// Mark `n` contiguous frames used without allocation-path bookkeeping.
/// Idempotent.
pub fn lock_pages(frame: FrameNumber, n: u64) {
    let _ = with_allocator(|alloc| {
        let mut bitmap = alloc.bitmap.lock();
        for pfn in frame.0..frame.0 + n {
            bitmap.set_used(pfn);
        }
    });
}

pub fn is_used(frame: FrameNumber) -> bool {
    with_allocator(|alloc| alloc.bitmap.lock().is_used(frame.0)).unwrap_or(true)
}

pub fn is_free(frame: FrameNumber) -> bool {
    !is_used(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_bitmap(total_frames: u64) -> Bitmap {
        let mut b = Bitmap::new(total_frames);
        for pfn in 0..total_frames {
            b.set_free(pfn);
        }
        b
    }

    #[test]
    fn allocates_first_free_run() {
        let mut b = fresh_bitmap(16);
        let start = b.find_run(4, 1).unwrap();
        assert_eq!(start, 0);
        for pfn in start..start + 4 {
            b.set_used(pfn);
        }
        let next = b.find_run(4, 1).unwrap();
        assert_eq!(next, 4);
    }

    #[test]
    fn alignment_is_respected() {
        let b = fresh_bitmap(64);
        let start = b.find_run(1, 8).unwrap();
        assert_eq!(start % 8, 0);
    }

    #[test]
    fn free_then_alloc_reuses_region() {
        let mut b = fresh_bitmap(8);
        b.set_used(0);
        b.set_used(1);
        b.set_free(0);
        b.set_free(1);
        let start = b.find_run(2, 1).unwrap();
        assert_eq!(start, 0);
    }

    #[test]
    fn out_of_memory_when_no_run_fits() {
        let mut b = fresh_bitmap(4);
        for pfn in 0..4 {
            b.set_used(pfn);
        }
        assert!(b.find_run(1, 1).is_none());
    }
}
