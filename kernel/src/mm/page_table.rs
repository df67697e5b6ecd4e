//! 4-level x86_64 page-table engine: address derivation, map/unmap, and TLB
//! flush policy.
//!
//! Intermediate PML4/PDPT/PD entries are allocated on demand from the frame
//! allocator and zeroed. `unmap_page` never frees those intermediate
//! tables — a known, bounded leak per address space, kept for v1 rather
//! than adding reference counting to every table node.

use bitflags::bitflags;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::{PhysAddr, VirtAddr};

use super::{frame_allocator, phys_to_virt, FrameNumber};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// PTE flag bits, named after the x86_64 architectural bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT  = 1 << 0;
        const RW       = 1 << 1;
        const US       = 1 << 2;
        const PWT      = 1 << 3;
        const PCD      = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        const HUGE     = 1 << 7;
        const GLOBAL   = 1 << 8;
        const NX       = 1 << 63;
    }
}

impl PageFlags {
    pub const KERNEL_DEFAULT: Self =
        Self::from_bits_truncate(Self::PRESENT.bits() | Self::RW.bits() | Self::GLOBAL.bits());
    pub const USER_DEFAULT: Self =
        Self::from_bits_truncate(Self::PRESENT.bits() | Self::RW.bits() | Self::US.bits());
}

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One page-table entry: present bit, frame, and flags packed into a
/// single `u64`, matching the hardware layout exactly.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn frame(&self) -> FrameNumber {
        FrameNumber::from_addr(self.0 & ADDR_MASK)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    pub fn set(&mut self, frame: FrameNumber, flags: PageFlags) {
        self.0 = (frame.addr() & ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 512-entry, 4 KiB-aligned page table (PML4, PDPT, PD, or PT).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    pub fn zeroed_at(virt: u64) -> &'static mut Self {
        // SAFETY: `virt` is the kernel alias of a freshly allocated,
        // page-aligned, page-sized frame, so this cast and the write
        // below are in-bounds and correctly aligned.
        unsafe {
            let table = virt as *mut Self;
            core::ptr::write_bytes(table, 0, 1);
            &mut *table
        }
    }

    /// # Safety
    /// `virt` must point to a live, page-aligned `PageTable` for the
    /// lifetime of the returned reference.
    pub unsafe fn from_virt<'a>(virt: u64) -> &'a mut Self {
        // SAFETY: delegated to the caller.
        unsafe { &mut *(virt as *mut Self) }
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, i: usize) -> &PageTableEntry {
        &self.entries[i]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, i: usize) -> &mut PageTableEntry {
        &mut self.entries[i]
    }
}

/// The four radix-tree indices plus the page offset derived from a virtual
/// address, per `(v>>39)&0x1ff, (v>>30)&0x1ff, (v>>21)&0x1ff, (v>>12)&0x1ff`.
#[derive(Debug, Clone, Copy)]
pub struct VirtualAddressBreakdown {
    pub l4: usize,
    pub l3: usize,
    pub l2: usize,
    pub l1: usize,
    pub offset: usize,
}

impl VirtualAddressBreakdown {
    pub fn new(v: u64) -> Self {
        Self {
            l4: ((v >> 39) & 0x1ff) as usize,
            l3: ((v >> 30) & 0x1ff) as usize,
            l2: ((v >> 21) & 0x1ff) as usize,
            l1: ((v >> 12) & 0x1ff) as usize,
            offset: (v & 0xfff) as usize,
        }
    }
}

/// Allocate a fresh, zeroed intermediate table frame and return its
/// physical frame number.
fn alloc_table_frame() -> KernelResult<FrameNumber> {
    let frame = frame_allocator::alloc_page()?;
    PageTable::zeroed_at(phys_to_virt(frame.addr()));
    Ok(frame)
}

fn table_at<'a>(frame: FrameNumber) -> &'a mut PageTable {
    // SAFETY: every frame reachable through a present PTE in a table we
    // manage was allocated by `alloc_table_frame` and zeroed as a
    // `PageTable`, and is never freed while still linked (see the module
    // doc comment on the leaked-intermediate-node policy).
    unsafe { PageTable::from_virt(phys_to_virt(frame.addr())) }
}

/// Ensure the translation `v → p` exists under `root`, allocating any
/// missing intermediate tables. Overwriting an existing present PTE is
/// permitted (remap); the caller is responsible for flushing.
pub fn map_page(v: u64, p: u64, flags: PageFlags, root: FrameNumber) -> KernelResult<()> {
    let idx = VirtualAddressBreakdown::new(v);
    let l4 = table_at(root);
    let l3 = descend_or_alloc(l4, idx.l4)?;
    let l2 = descend_or_alloc(l3, idx.l3)?;
    let l1 = descend_or_alloc(l2, idx.l2)?;
    l1[idx.l1].set(FrameNumber::from_addr(p), flags | PageFlags::PRESENT);
    Ok(())
}

/// Same as [`map_page`] but terminates at the PD level with a 2 MiB leaf.
pub fn map_large_page(v: u64, p: u64, flags: PageFlags, root: FrameNumber) -> KernelResult<()> {
    let idx = VirtualAddressBreakdown::new(v);
    let l4 = table_at(root);
    let l3 = descend_or_alloc(l4, idx.l4)?;
    let l2 = descend_or_alloc(l3, idx.l3)?;
    l2[idx.l2].set(
        FrameNumber::from_addr(p),
        flags | PageFlags::PRESENT | PageFlags::HUGE,
    );
    Ok(())
}

fn descend_or_alloc(table: &mut PageTable, index: usize) -> KernelResult<&mut PageTable> {
    if !table[index].is_present() {
        let frame = alloc_table_frame()?;
        table[index].set(frame, PageFlags::PRESENT | PageFlags::RW | PageFlags::US);
    }
    let frame = table[index].frame();
    Ok(table_at(frame))
}

/// Clear the leaf PTE's present bit. Never frees intermediate tables;
/// never flushes the TLB (the caller must).
pub fn unmap_page(v: u64, root: FrameNumber) -> KernelResult<FrameNumber> {
    let idx = VirtualAddressBreakdown::new(v);
    let l4 = table_at(root);
    if !l4[idx.l4].is_present() {
        return Err(KernelError::NotFound { resource: "pml4e", id: v });
    }
    let l3 = table_at(l4[idx.l4].frame());
    if !l3[idx.l3].is_present() {
        return Err(KernelError::NotFound { resource: "pdpte", id: v });
    }
    let l2 = table_at(l3[idx.l3].frame());
    if !l2[idx.l2].is_present() {
        return Err(KernelError::NotFound { resource: "pde", id: v });
    }
    let l1 = table_at(l2[idx.l2].frame());
    if !l1[idx.l1].is_present() {
        return Err(KernelError::NotFound { resource: "pte", id: v });
    }
    let frame = l1[idx.l1].frame();
    l1[idx.l1].clear();
    Ok(frame)
}

/// Walk the tables; `None` if any level is absent.
pub fn get_physical_address(v: u64, root: FrameNumber) -> Option<u64> {
    let idx = VirtualAddressBreakdown::new(v);
    let l4 = table_at(root);
    if !l4[idx.l4].is_present() {
        return None;
    }
    let l3 = table_at(l4[idx.l4].frame());
    if !l3[idx.l3].is_present() {
        return None;
    }
    let l2 = table_at(l3[idx.l3].frame());
    if !l2[idx.l2].is_present() {
        return None;
    }
    if l2[idx.l2].flags().contains(PageFlags::HUGE) {
        return Some(l2[idx.l2].frame().addr() + (v & 0x1f_ffff));
    }
    let l1 = table_at(l2[idx.l2].frame());
    if !l1[idx.l1].is_present() {
        return None;
    }
    Some(l1[idx.l1].frame().addr() + idx.offset as u64)
}

/// Write the physical address of `root` to CR3. Implicitly flushes the
/// non-global TLB.
pub fn set_current_page_table(root: FrameNumber) {
    let frame =
        x86_64::structures::paging::PhysFrame::containing_address(PhysAddr::new(root.addr()));
    // SAFETY: `root` points to a fully-populated PML4 that at minimum
    // shares the kernel's higher-half mappings, so switching to it cannot
    // strand the instruction pointer.
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

pub fn current_page_table() -> FrameNumber {
    let (frame, _) = Cr3::read();
    FrameNumber::from_addr(frame.start_address().as_u64())
}

pub fn flush_tlb_page(v: u64) {
    x86_64::instructions::tlb::flush(VirtAddr::new(v));
}

pub fn flush_tlb_all() {
    x86_64::instructions::tlb::flush_all();
}

/// Initialize the page-table subsystem. A no-op placeholder today: the
/// bootloader-provided tables are used as-is until C7 reprograms the PAT.
pub fn init() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_breakdown_matches_spec_shifts() {
        let v = 0x0000_1234_5678_9000u64;
        let b = VirtualAddressBreakdown::new(v);
        assert_eq!(b.l4, ((v >> 39) & 0x1ff) as usize);
        assert_eq!(b.l3, ((v >> 30) & 0x1ff) as usize);
        assert_eq!(b.l2, ((v >> 21) & 0x1ff) as usize);
        assert_eq!(b.l1, ((v >> 12) & 0x1ff) as usize);
        assert_eq!(b.offset, (v & 0xfff) as usize);
    }

    #[test]
    fn pte_round_trips_frame_and_flags() {
        let mut pte = PageTableEntry::empty();
        assert!(!pte.is_present());
        let frame = FrameNumber(42);
        pte.set(frame, PageFlags::PRESENT | PageFlags::RW);
        assert!(pte.is_present());
        assert_eq!(pte.frame(), frame);
        assert!(pte.flags().contains(PageFlags::RW));
        pte.clear();
        assert!(!pte.is_present());
    }
}
