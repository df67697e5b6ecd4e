//! Per-process virtual memory areas and the `mm_context` they live in.
//!
//! Backs the `mmap`/`munmap`/`brk` syscalls. VMAs are kept in a single
//! address-ordered `Vec` rather than a `BTreeMap` — the list stays short
//! (a handful of mappings per process) and ordered iteration is the common
//! case for every operation here (overlap scans, merges, free-range search).

use alloc::vec::Vec;

use spin::Mutex;

use super::page_table::{self, PageFlags};
use super::{frame_allocator, FrameNumber, PAGE_SIZE, USERSPACE_END, USERSPACE_START};
use crate::error::{KernelError, KernelResult};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED    = 1 << 0;
        const PRIVATE   = 1 << 1;
        const FIXED     = 1 << 4;
        const ANONYMOUS = 1 << 5;
    }
}

/// Whether a VMA is anonymous (zero-filled, no backing) or file-backed.
/// File-backed mappings are parsed but rejected with `unsupported_operation`
/// in v1 — there is no filesystem to back them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    Anonymous,
    File { handle: u64, offset: u64 },
}

/// A half-open interval `[start, end)` of user virtual address space.
#[derive(Debug, Clone)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub prot: Prot,
    pub shared: bool,
    pub kind: VmaKind,
}

impl Vma {
    fn len(&self) -> u64 {
        self.end - self.start
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    /// Whether `self` and `other` are mergeable: adjacent, identical
    /// protection/sharing, and (for file-backed VMAs) contiguous offsets.
    fn mergeable_with(&self, other: &Vma) -> bool {
        if self.end != other.start || self.prot != other.prot || self.shared != other.shared {
            return false;
        }
        match (&self.kind, &other.kind) {
            (VmaKind::Anonymous, VmaKind::Anonymous) => true,
            (
                VmaKind::File { handle: h1, offset: o1 },
                VmaKind::File { handle: h2, offset: o2 },
            ) => h1 == h2 && o1 + self.len() == *o2,
            _ => false,
        }
    }

    fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::PRESENT | PageFlags::US;
        if self.prot.contains(Prot::WRITE) {
            flags |= PageFlags::RW;
        }
        if !self.prot.contains(Prot::EXEC) {
            flags |= PageFlags::NX;
        }
        flags
    }
}

/// The per-process address-space descriptor: root page table, VMA list, and
/// heap/stack bounds. Owned by its `Task` through an `Arc`; the VMA list
/// itself is uniquely owned here (see the design notes on cyclic
/// ownership).
pub struct MmContext {
    pub root: FrameNumber,
    vmas: Mutex<Vec<Vma>>,
    heap_start: Mutex<u64>,
    heap_end: Mutex<u64>,
}

impl MmContext {
    pub fn new(root: FrameNumber, heap_start: u64) -> Self {
        Self {
            root,
            vmas: Mutex::new(Vec::new()),
            heap_start: Mutex::new(heap_start),
            heap_end: Mutex::new(heap_start),
        }
    }

    /// First gap of at least `length` bytes, `align`-aligned, in the VMA
    /// list — starting at `hint` if it fits there, else the lowest legal
    /// address above the current heap end.
    fn find_free_vma_range(&self, vmas: &[Vma], length: u64, align: u64, hint: u64) -> KernelResult<u64> {
        let align = align.max(PAGE_SIZE as u64);
        let align_up = |a: u64| (a + align - 1) & !(align - 1);

        let candidates = core::iter::once(align_up(hint.max(USERSPACE_START)))
            .chain(core::iter::once(align_up(*self.heap_end.lock())));

        for candidate in candidates {
            if self.range_is_free(vmas, candidate, length) {
                return Ok(candidate);
            }
        }

        let mut cursor = align_up(*self.heap_end.lock());
        for vma in vmas {
            if cursor + length <= vma.start {
                return Ok(cursor);
            }
            cursor = align_up(vma.end.max(cursor));
        }
        if cursor + length <= USERSPACE_END {
            return Ok(cursor);
        }
        Err(KernelError::OutOfMemory { requested: length as usize, available: 0 })
    }

    fn range_is_free(&self, vmas: &[Vma], start: u64, length: u64) -> bool {
        let end = start + length;
        if end > USERSPACE_END || start < USERSPACE_START {
            return false;
        }
        vmas.iter().all(|v| !v.overlaps(start, end))
    }

    /// Insert `vma`, keeping the list ordered by `start`, then merge it with
    /// its neighbors where permitted.
    fn create_vma(&self, vmas: &mut Vec<Vma>, vma: Vma) -> usize {
        let index = vmas.partition_point(|v| v.start < vma.start);
        vmas.insert(index, vma);
        self.merge_at(vmas, index)
    }

    /// Find the VMA containing `addr`.
    pub fn find_vma(&self, addr: u64) -> Option<Vma> {
        self.vmas.lock().iter().find(|v| v.contains(addr)).cloned()
    }

    /// Split the VMA at `vmas[index]` at `addr`, truncating it to
    /// `[start, addr)` and inserting a new VMA for `[addr, end)` right
    /// after it. Returns the index of the new right half, or `None` if
    /// `addr` sits at either boundary (no-op).
    fn split_at(&self, vmas: &mut Vec<Vma>, index: usize, addr: u64) -> Option<usize> {
        let vma = &mut vmas[index];
        if addr <= vma.start || addr >= vma.end {
            return None;
        }
        let mut right = vma.clone();
        right.start = addr;
        if let VmaKind::File { offset, .. } = &mut right.kind {
            *offset += addr - vma.start;
        }
        vma.end = addr;
        vmas.insert(index + 1, right);
        Some(index + 1)
    }

    /// Attempt to merge `vmas[index]` with its immediate predecessor and
    /// successor. Returns the (possibly shifted) index of the surviving
    /// entry.
    fn merge_at(&self, vmas: &mut Vec<Vma>, mut index: usize) -> usize {
        if index + 1 < vmas.len() && vmas[index].mergeable_with(&vmas[index + 1]) {
            let next_end = vmas[index + 1].end;
            vmas[index].end = next_end;
            vmas.remove(index + 1);
        }
        if index > 0 && vmas[index - 1].mergeable_with(&vmas[index]) {
            let end = vmas[index].end;
            vmas[index - 1].end = end;
            vmas.remove(index);
            index -= 1;
        }
        index
    }

    /// Remove the overlap `[start, end)` from the VMA at `index`, splitting
    /// or truncating as needed per the four `MAP_FIXED`/`munmap` overlap
    /// cases. Unmaps and frees every page in the overlap. Returns the
    /// number of entries removed from the list so the caller can re-index.
    fn carve_overlap(&self, vmas: &mut Vec<Vma>, index: usize, start: u64, end: u64) -> isize {
        let vma = vmas[index].clone();
        let overlap_start = vma.start.max(start);
        let overlap_end = vma.end.min(end);
        self.unmap_range(overlap_start, overlap_end);

        let starts_inside = overlap_start > vma.start;
        let ends_inside = overlap_end < vma.end;

        match (starts_inside, ends_inside) {
            // Overlap fully contained in the VMA: split into two, drop the middle.
            (true, true) => {
                let mut right = vma.clone();
                right.start = overlap_end;
                if let VmaKind::File { offset, .. } = &mut right.kind {
                    *offset += overlap_end - vma.start;
                }
                vmas[index].end = overlap_start;
                vmas.insert(index + 1, right);
                0
            }
            // VMA fully contained in the overlap: remove it entirely.
            (false, false) => {
                vmas.remove(index);
                -1
            }
            // VMA straddles the overlap's start: truncate to [start, overlap_start).
            (false, true) => {
                vmas[index].end = overlap_start;
                0
            }
            // VMA straddles the overlap's end: raise to [overlap_end, end).
            (true, false) => {
                if let VmaKind::File { offset, .. } = &mut vmas[index].kind {
                    *offset += overlap_end - vma.start;
                }
                vmas[index].start = overlap_end;
                0
            }
        }
    }

    fn unmap_range(&self, start: u64, end: u64) {
        let mut v = start;
        while v < end {
            if let Ok(frame) = page_table::unmap_page(v, self.root) {
                frame_allocator::free_page(frame);
            }
            page_table::flush_tlb_page(v);
            v += PAGE_SIZE as u64;
        }
    }

    /// `mmap`: see the operation contract in the memory-management design —
    /// validate, choose a target address, carve any `MAP_FIXED` overlap,
    /// install the VMA, then eagerly allocate and map every page,
    /// transactionally unwinding on failure.
    pub fn mmap(
        &self,
        addr: u64,
        length: u64,
        prot: Prot,
        flags: MapFlags,
        kind: VmaKind,
    ) -> KernelResult<u64> {
        if length == 0 {
            return Err(KernelError::InvalidArgument { name: "length", value: 0 });
        }
        if !matches!(kind, VmaKind::Anonymous) {
            return Err(KernelError::UnsupportedOperation { operation: "file-backed mmap" });
        }
        let exactly_one_sharing = flags.contains(MapFlags::SHARED) ^ flags.contains(MapFlags::PRIVATE);
        if !exactly_one_sharing {
            return Err(KernelError::InvalidArgument { name: "flags", value: flags.bits() as usize });
        }
        if flags.contains(MapFlags::FIXED) && addr % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument { name: "addr", value: addr as usize });
        }
        if length > u64::MAX - (PAGE_SIZE as u64 - 1) {
            return Err(KernelError::InvalidArgument { name: "length", value: length as usize });
        }

        let length = (length + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);

        let mut vmas = self.vmas.lock();

        let base = if flags.contains(MapFlags::FIXED) {
            let target_end = addr + length;
            let mut i = 0;
            while i < vmas.len() {
                if vmas[i].overlaps(addr, target_end) {
                    let delta = self.carve_overlap(&mut vmas, i, addr, target_end);
                    if delta < 0 {
                        continue;
                    }
                }
                i += 1;
            }
            addr
        } else {
            self.find_free_vma_range(&vmas, length, 0, addr)?
        };

        let vma = Vma {
            start: base,
            end: base + length,
            prot,
            shared: flags.contains(MapFlags::SHARED),
            kind,
        };
        let index = self.create_vma(&mut vmas, vma);
        let page_flags = vmas[index].page_flags();

        let mut mapped: Vec<u64> = Vec::new();
        let mut v = base;
        while v < base + length {
            let frame = match frame_allocator::alloc_page() {
                Ok(frame) => frame,
                Err(e) => {
                    for mapped_v in mapped {
                        if let Ok(frame) = page_table::unmap_page(mapped_v, self.root) {
                            frame_allocator::free_page(frame);
                        }
                        page_table::flush_tlb_page(mapped_v);
                    }
                    vmas.retain(|existing| existing.start != base || existing.end != base + length);
                    return Err(e);
                }
            };
            if let Err(e) = page_table::map_page(v, frame.addr(), page_flags, self.root) {
                frame_allocator::free_page(frame);
                for mapped_v in mapped {
                    if let Ok(frame) = page_table::unmap_page(mapped_v, self.root) {
                        frame_allocator::free_page(frame);
                    }
                    page_table::flush_tlb_page(mapped_v);
                }
                vmas.retain(|existing| existing.start != base || existing.end != base + length);
                return Err(e);
            }
            page_table::flush_tlb_page(v);
            let virt = super::phys_to_virt(frame.addr());
            // SAFETY: `virt` is this frame's freshly mapped kernel alias;
            // anonymous mmap pages must be zero-filled per POSIX.
            unsafe {
                core::ptr::write_bytes(virt as *mut u8, 0, PAGE_SIZE);
            }
            mapped.push(v);
            v += PAGE_SIZE as u64;
        }

        Ok(base)
    }

    /// `munmap`: tolerant of gaps, never partially fails. Unconditionally
    /// attempts `merge_vmas` after every mutation.
    pub fn munmap(&self, addr: u64, length: u64) -> KernelResult<()> {
        if addr == 0 || length == 0 || addr % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument { name: "addr", value: addr as usize });
        }
        let length = (length + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let end = addr + length;
        if end > USERSPACE_END {
            return Err(KernelError::InvalidArgument { name: "length", value: length as usize });
        }

        let mut vmas = self.vmas.lock();
        let mut i = 0;
        while i < vmas.len() {
            if !vmas[i].overlaps(addr, end) {
                i += 1;
                continue;
            }
            let delta = self.carve_overlap(&mut vmas, i, addr, end);
            // Always attempt a merge around the mutated slot, even when the
            // overlap removed the VMA outright — there is no early-return
            // path here regardless of which of the four cases fired.
            if delta < 0 {
                if i > 0 && i < vmas.len() {
                    self.merge_at(&mut vmas, i.saturating_sub(1));
                }
            } else {
                i = self.merge_at(&mut vmas, i);
                i += 1;
            }
        }
        Ok(())
    }

    /// `brk`: grow or shrink `[heap_start, heap_end)`. Returns the
    /// (possibly unchanged) heap end.
    pub fn brk(&self, new_end: u64) -> u64 {
        if new_end == 0 {
            return *self.heap_end.lock();
        }
        let heap_start = *self.heap_start.lock();
        let mut heap_end = self.heap_end.lock();
        if new_end < heap_start {
            return *heap_end;
        }
        if new_end == *heap_end {
            return *heap_end;
        }

        let aligned_new = (new_end + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let aligned_old = (*heap_end + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);

        if aligned_new > aligned_old {
            let grow_flags = PageFlags::PRESENT | PageFlags::RW | PageFlags::US | PageFlags::NX;
            let mut v = aligned_old;
            let mut mapped = Vec::new();
            while v < aligned_new {
                let frame = match frame_allocator::alloc_page() {
                    Ok(f) => f,
                    Err(_) => {
                        for mapped_v in mapped {
                            if let Ok(frame) = page_table::unmap_page(mapped_v, self.root) {
                                frame_allocator::free_page(frame);
                            }
                        }
                        return *heap_end;
                    }
                };
                if page_table::map_page(v, frame.addr(), grow_flags, self.root).is_err() {
                    frame_allocator::free_page(frame);
                    for mapped_v in mapped {
                        if let Ok(frame) = page_table::unmap_page(mapped_v, self.root) {
                            frame_allocator::free_page(frame);
                        }
                    }
                    return *heap_end;
                }
                page_table::flush_tlb_page(v);
                let virt = super::phys_to_virt(frame.addr());
                // SAFETY: freshly mapped frame, zero-filled per brk semantics.
                unsafe { core::ptr::write_bytes(virt as *mut u8, 0, PAGE_SIZE) };
                mapped.push(v);
                v += PAGE_SIZE as u64;
            }
        } else if aligned_new < aligned_old {
            self.unmap_range(aligned_new, aligned_old);
        }

        *heap_end = new_end;
        new_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vma(start: u64, end: u64) -> Vma {
        Vma { start, end, prot: Prot::READ | Prot::WRITE, shared: false, kind: VmaKind::Anonymous }
    }

    #[test]
    fn mergeable_requires_adjacency_and_matching_prot() {
        let a = vma(0x1000, 0x2000);
        let mut b = vma(0x2000, 0x3000);
        assert!(a.mergeable_with(&b));
        b.prot = Prot::READ;
        assert!(!a.mergeable_with(&b));
    }

    #[test]
    fn split_produces_disjoint_halves() {
        let ctx = MmContext::new(FrameNumber(0), USERSPACE_START);
        let mut vmas = alloc::vec![vma(0x1000, 0x3000)];
        let right = ctx.split_at(&mut vmas, 0, 0x2000).unwrap();
        assert_eq!(vmas[0].end, 0x2000);
        assert_eq!(vmas[right].start, 0x2000);
        assert_eq!(vmas[right].end, 0x3000);
    }

    #[test]
    fn split_at_boundary_is_noop() {
        let ctx = MmContext::new(FrameNumber(0), USERSPACE_START);
        let mut vmas = alloc::vec![vma(0x1000, 0x2000)];
        assert!(ctx.split_at(&mut vmas, 0, 0x1000).is_none());
        assert!(ctx.split_at(&mut vmas, 0, 0x2000).is_none());
    }

    #[test]
    fn find_free_range_skips_existing_vmas() {
        let ctx = MmContext::new(FrameNumber(0), USERSPACE_START);
        let vmas = alloc::vec![vma(USERSPACE_START, USERSPACE_START + 0x1000)];
        let found = ctx.find_free_vma_range(&vmas, 0x1000, 0, 0).unwrap();
        assert!(found >= USERSPACE_START + 0x1000);
    }
}
