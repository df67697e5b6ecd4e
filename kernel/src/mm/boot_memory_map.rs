//! Read-only view over the physical memory layout handed to the kernel by
//! firmware, normalized at construction so consumers never have to worry
//! about overlapping or unsorted entries.

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};

/// Category of a physical memory region, independent of which boot protocol
/// reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Free RAM usable by the kernel.
    Conventional,
    /// In use by the bootloader itself, or otherwise not reclaimable.
    Reserved,
    /// ACPI tables the firmware asks to be preserved until reclaimed.
    AcpiReclaimable,
    /// ACPI NVS — must never be reused.
    AcpiNvs,
    /// Memory-mapped device space.
    Mmio,
    /// Code/data belonging to the bootloader or kernel loader itself.
    Bootloader,
    /// Anything the boot protocol reported that doesn't fit the above.
    Unknown,
}

fn map_kind(kind: MemoryRegionKind) -> RegionKind {
    match kind {
        MemoryRegionKind::Usable => RegionKind::Conventional,
        MemoryRegionKind::Bootloader => RegionKind::Bootloader,
        MemoryRegionKind::UnknownUefi(_) | MemoryRegionKind::UnknownBios(_) => RegionKind::Unknown,
        _ => RegionKind::Reserved,
    }
}

/// A single normalized memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootMemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl BootMemoryMapEntry {
    pub fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// Maximum number of regions this implementation tracks. Real firmware maps
/// rarely exceed a few dozen entries; this bound keeps the structure
/// allocation-free so it can be built before the kernel heap exists.
const MAX_ENTRIES: usize = 128;

/// Normalized, read-only view over the boot-time physical memory map.
pub struct BootMemoryMap {
    entries: [BootMemoryMapEntry; MAX_ENTRIES],
    count: usize,
}

impl BootMemoryMap {
    /// Build from the bootloader's `MemoryRegions` slice. Entries are
    /// sorted by base address; the source is not assumed to already be
    /// sorted or non-overlapping.
    pub fn from_regions(regions: &MemoryRegions) -> Self {
        const EMPTY: BootMemoryMapEntry = BootMemoryMapEntry {
            base: 0,
            length: 0,
            kind: RegionKind::Unknown,
        };
        let mut entries = [EMPTY; MAX_ENTRIES];
        let mut count = 0;

        for region in regions.iter() {
            if count >= MAX_ENTRIES {
                break;
            }
            entries[count] = BootMemoryMapEntry {
                base: region.start,
                length: region.end.saturating_sub(region.start),
                kind: map_kind(region.kind),
            };
            count += 1;
        }

        // Insertion sort by base: count is small and this runs once at boot.
        for i in 1..count {
            let mut j = i;
            while j > 0 && entries[j - 1].base > entries[j].base {
                entries.swap(j - 1, j);
                j -= 1;
            }
        }

        Self { entries, count }
    }

    pub fn entries(&self) -> &[BootMemoryMapEntry] {
        &self.entries[..self.count]
    }

    pub fn total_memory(&self) -> u64 {
        self.entries().iter().map(|e| e.length).sum()
    }

    pub fn total_conventional(&self) -> u64 {
        self.entries()
            .iter()
            .filter(|e| e.kind == RegionKind::Conventional)
            .map(|e| e.length)
            .sum()
    }

    pub fn highest_address(&self) -> u64 {
        self.entries().iter().map(|e| e.end()).max().unwrap_or(0)
    }

    pub fn largest_conventional(&self) -> Option<BootMemoryMapEntry> {
        self.entries()
            .iter()
            .filter(|e| e.kind == RegionKind::Conventional)
            .max_by_key(|e| e.length)
            .copied()
    }

    /// First conventional entry whose intersection with `[min_addr,
    /// max_addr)` is at least `size` bytes. Returns the intersected range.
    pub fn find_segment(
        &self,
        min_addr: u64,
        max_addr: u64,
        size: u64,
    ) -> Option<BootMemoryMapEntry> {
        for entry in self.entries() {
            if entry.kind != RegionKind::Conventional {
                continue;
            }
            let lo = entry.base.max(min_addr);
            let hi = entry.end().min(max_addr);
            if hi > lo && hi - lo >= size {
                return Some(BootMemoryMapEntry {
                    base: lo,
                    length: hi - lo,
                    kind: RegionKind::Conventional,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(base: u64, length: u64, kind: RegionKind) -> BootMemoryMapEntry {
        BootMemoryMapEntry { base, length, kind }
    }

    fn map_from(entries: &[BootMemoryMapEntry]) -> BootMemoryMap {
        const EMPTY: BootMemoryMapEntry = BootMemoryMapEntry {
            base: 0,
            length: 0,
            kind: RegionKind::Unknown,
        };
        let mut arr = [EMPTY; MAX_ENTRIES];
        arr[..entries.len()].copy_from_slice(entries);
        BootMemoryMap {
            entries: arr,
            count: entries.len(),
        }
    }

    #[test]
    fn totals_sum_correctly() {
        let map = map_from(&[
            entry(0, 0x1000, RegionKind::Reserved),
            entry(0x1000, 0x2000, RegionKind::Conventional),
        ]);
        assert_eq!(map.total_memory(), 0x3000);
        assert_eq!(map.total_conventional(), 0x2000);
        assert_eq!(map.highest_address(), 0x3000);
    }

    #[test]
    fn find_segment_respects_bounds() {
        let map = map_from(&[entry(0x100000, 0x100000, RegionKind::Conventional)]);
        assert!(map.find_segment(0, 0x100000, 0x1000).is_none());
        let found = map.find_segment(0x100000, 0x200000, 0x1000).unwrap();
        assert_eq!(found.base, 0x100000);
    }

    #[test]
    fn largest_conventional_ignores_reserved() {
        let map = map_from(&[
            entry(0, 0x10000, RegionKind::Conventional),
            entry(0x10000, 0x100000, RegionKind::Reserved),
            entry(0x110000, 0x20000, RegionKind::Conventional),
        ]);
        let largest = map.largest_conventional().unwrap();
        assert_eq!(largest.base, 0x110000);
        assert_eq!(largest.length, 0x20000);
    }
}
