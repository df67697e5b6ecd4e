//! Minimal ACPI table parser: just enough to enumerate the CPUs this
//! machine actually has, for AP startup to target.
//!
//! Parses the MADT (Multiple APIC Description Table) out of the RSDT/XSDT
//! reachable from the firmware's RSDP. PCIe ECAM (MCFG), IOMMU (DMAR), and
//! NUMA topology (SRAT/SLIT) tables are out of scope and are skipped.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::phys_to_virt;

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const RSDT_SIGNATURE: &[u8; 4] = b"RSDT";
const XSDT_SIGNATURE: &[u8; 4] = b"XSDT";
const MADT_SIGNATURE: &[u8; 4] = b"APIC";

const MADT_LOCAL_APIC: u8 = 0;

const MAX_CPUS: usize = 16;

/// Local APIC entry from the MADT.
#[derive(Debug, Clone, Copy)]
pub struct MadtLocalApic {
    pub acpi_processor_id: u8,
    pub apic_id: u8,
    /// Bit 0: processor enabled; bit 1: online capable.
    pub flags: u32,
}

impl MadtLocalApic {
    pub fn is_usable(&self) -> bool {
        (self.flags & 0x01) != 0 || (self.flags & 0x02) != 0
    }
}

/// Parsed ACPI information, populated by [`init`].
#[derive(Debug)]
pub struct AcpiInfo {
    pub local_apic_address: u32,
    pub local_apics: [Option<MadtLocalApic>; MAX_CPUS],
    pub local_apic_count: usize,
    pub has_madt: bool,
}

impl AcpiInfo {
    const fn new() -> Self {
        Self {
            local_apic_address: 0xFEE0_0000,
            local_apics: [None; MAX_CPUS],
            local_apic_count: 0,
            has_madt: false,
        }
    }

    /// Count usable CPUs (BSP included).
    pub fn cpu_count(&self) -> usize {
        self.local_apics[..self.local_apic_count]
            .iter()
            .flatten()
            .filter(|l| l.is_usable())
            .count()
    }

    /// APIC IDs of every usable CPU, BSP included.
    pub fn usable_apic_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.local_apics[..self.local_apic_count]
            .iter()
            .flatten()
            .filter(|l| l.is_usable())
            .map(|l| l.apic_id)
    }
}

static ACPI_INITIALIZED: AtomicBool = AtomicBool::new(false);
static ACPI_INFO: Mutex<AcpiInfo> = Mutex::new(AcpiInfo::new());

pub fn is_initialized() -> bool {
    ACPI_INITIALIZED.load(Ordering::Acquire)
}

pub fn with_acpi_info<R, F: FnOnce(&AcpiInfo) -> R>(f: F) -> Option<R> {
    if !is_initialized() {
        return None;
    }
    Some(f(&ACPI_INFO.lock()))
}

#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

#[repr(C, packed)]
struct Rsdp2 {
    base: Rsdp,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    _reserved: [u8; 3],
}

#[repr(C, packed)]
struct AcpiSdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[repr(C, packed)]
struct MadtHeader {
    sdt: AcpiSdtHeader,
    local_apic_address: u32,
    flags: u32,
}

#[repr(C, packed)]
struct MadtEntryHeader {
    entry_type: u8,
    length: u8,
}

#[repr(C, packed)]
struct MadtLocalApicEntry {
    header: MadtEntryHeader,
    acpi_processor_id: u8,
    apic_id: u8,
    flags: u32,
}

fn validate_checksum(addr: usize, len: usize) -> bool {
    let mut sum: u8 = 0;
    for i in 0..len {
        // SAFETY: addr..addr+len lies within an ACPI table mapped by the
        // kernel's direct physical memory window.
        sum = sum.wrapping_add(unsafe { *((addr + i) as *const u8) });
    }
    sum == 0
}

fn parse_madt(header_vaddr: usize, info: &mut AcpiInfo) {
    // SAFETY: header_vaddr points to a MADT table mapped via phys_to_virt.
    let madt = unsafe { &*(header_vaddr as *const MadtHeader) };
    let table_len = { madt.sdt.length } as usize;

    info.local_apic_address = madt.local_apic_address;
    info.has_madt = true;

    let entries_start = header_vaddr + core::mem::size_of::<MadtHeader>();
    let entries_end = header_vaddr + table_len;
    let mut offset = entries_start;

    while offset + 2 <= entries_end {
        // SAFETY: offset is within the MADT bounds checked above.
        let entry_header = unsafe { &*(offset as *const MadtEntryHeader) };
        let entry_len = entry_header.length as usize;
        if entry_len < 2 || offset + entry_len > entries_end {
            break;
        }

        if entry_header.entry_type == MADT_LOCAL_APIC
            && entry_len >= core::mem::size_of::<MadtLocalApicEntry>()
            && info.local_apic_count < MAX_CPUS
        {
            // SAFETY: entry type 0 has the MadtLocalApicEntry layout and the
            // length was checked above.
            let entry = unsafe { &*(offset as *const MadtLocalApicEntry) };
            info.local_apics[info.local_apic_count] = Some(MadtLocalApic {
                acpi_processor_id: entry.acpi_processor_id,
                apic_id: entry.apic_id,
                flags: { entry.flags },
            });
            info.local_apic_count += 1;
        }

        offset += entry_len;
    }
}

fn parse_rsdt(rsdt_vaddr: usize, info: &mut AcpiInfo) -> KernelResult<()> {
    // SAFETY: rsdt_vaddr points to the RSDT mapped via phys_to_virt.
    let sdt = unsafe { &*(rsdt_vaddr as *const AcpiSdtHeader) };
    if &{ sdt.signature } != RSDT_SIGNATURE {
        return Err(KernelError::InvalidArgument {
            name: "acpi_rsdt_signature",
            value: rsdt_vaddr,
        });
    }
    let len = { sdt.length } as usize;
    let header_size = core::mem::size_of::<AcpiSdtHeader>();
    let num_entries = (len - header_size) / 4;

    for i in 0..num_entries {
        let ptr_addr = rsdt_vaddr + header_size + i * 4;
        // SAFETY: ptr_addr lies within the RSDT bounds computed above.
        let phys_addr = unsafe { *(ptr_addr as *const u32) } as u64;
        let vaddr = phys_to_virt(phys_addr) as usize;
        // SAFETY: vaddr is derived from a 4-byte-aligned physical pointer
        // table entry; the ACPI SDT header itself starts with its signature.
        let entry_sig = unsafe { (*(vaddr as *const AcpiSdtHeader)).signature };
        if &entry_sig == MADT_SIGNATURE {
            parse_madt(vaddr, info);
        }
    }
    Ok(())
}

fn parse_xsdt(xsdt_vaddr: usize, info: &mut AcpiInfo) -> KernelResult<()> {
    // SAFETY: xsdt_vaddr points to the XSDT mapped via phys_to_virt.
    let sdt = unsafe { &*(xsdt_vaddr as *const AcpiSdtHeader) };
    if &{ sdt.signature } != XSDT_SIGNATURE {
        return Err(KernelError::InvalidArgument {
            name: "acpi_xsdt_signature",
            value: xsdt_vaddr,
        });
    }
    let len = { sdt.length } as usize;
    let header_size = core::mem::size_of::<AcpiSdtHeader>();
    let num_entries = (len - header_size) / 8;

    for i in 0..num_entries {
        let ptr_addr = xsdt_vaddr + header_size + i * 8;
        // SAFETY: ptr_addr lies within the XSDT bounds computed above.
        let phys_addr = unsafe { *(ptr_addr as *const u64) };
        let vaddr = phys_to_virt(phys_addr) as usize;
        // SAFETY: see parse_rsdt.
        let entry_sig = unsafe { (*(vaddr as *const AcpiSdtHeader)).signature };
        if &entry_sig == MADT_SIGNATURE {
            parse_madt(vaddr, info);
        }
    }
    Ok(())
}

/// Parse ACPI tables starting from the firmware-reported RSDP physical
/// address. Must run after [`crate::mm::init`] has populated the direct
/// physical mapping window.
pub fn init(rsdp_phys: u64) -> KernelResult<()> {
    if ACPI_INITIALIZED.load(Ordering::Acquire) {
        return Err(KernelError::AlreadyExists {
            resource: "acpi",
            id: 0,
        });
    }

    let rsdp_vaddr = phys_to_virt(rsdp_phys) as usize;
    // SAFETY: rsdp_vaddr is the mapped alias of the firmware-reported RSDP.
    let rsdp = unsafe { &*(rsdp_vaddr as *const Rsdp) };
    if &rsdp.signature != RSDP_SIGNATURE {
        return Err(KernelError::InvalidArgument {
            name: "acpi_rsdp_signature",
            value: rsdp_vaddr,
        });
    }
    if !validate_checksum(rsdp_vaddr, 20) {
        log::warn!("RSDP checksum invalid, continuing anyway");
    }

    let mut info = AcpiInfo::new();

    if rsdp.revision >= 2 {
        // SAFETY: ACPI 2.0+ RSDPs are at least size_of::<Rsdp2>() bytes.
        let rsdp2 = unsafe { &*(rsdp_vaddr as *const Rsdp2) };
        let xsdt_phys = { rsdp2.xsdt_address };
        if xsdt_phys != 0 {
            parse_xsdt(phys_to_virt(xsdt_phys) as usize, &mut info)?;
        } else {
            parse_rsdt(phys_to_virt(rsdp.rsdt_address as u64) as usize, &mut info)?;
        }
    } else {
        parse_rsdt(phys_to_virt(rsdp.rsdt_address as u64) as usize, &mut info)?;
    }

    if !info.has_madt {
        log::warn!("no MADT found, assuming a single usable CPU");
        info.local_apics[0] = Some(MadtLocalApic {
            acpi_processor_id: 0,
            apic_id: 0,
            flags: 1,
        });
        info.local_apic_count = 1;
    }

    log::info!(
        "ACPI: {} usable CPU(s), LAPIC at {:#x}",
        info.cpu_count(),
        info.local_apic_address
    );

    *ACPI_INFO.lock() = info;
    ACPI_INITIALIZED.store(true, Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn madt_local_apic_usable_flag() {
        let usable = MadtLocalApic {
            acpi_processor_id: 0,
            apic_id: 0,
            flags: 1,
        };
        let disabled = MadtLocalApic {
            acpi_processor_id: 1,
            apic_id: 1,
            flags: 0,
        };
        assert!(usable.is_usable());
        assert!(!disabled.is_usable());
    }
}
