//! Entry point handed to us by `bootloader_api`.
//!
//! Extracts the physical memory offset, memory map, and kernel image bounds
//! from [`BootInfo`] and hands them to [`crate::mm::init`] before falling
//! through to the rest of bring-up.

use bootloader_api::{entry_point, BootInfo};

entry_point!(kernel_main);

/// Heap size used until [`crate::config::BootConfig`] is parsed from the
/// command line.
const DEFAULT_HEAP_SIZE: usize = 16 * 1024 * 1024;

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    let phys_mem_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not map physical memory");

    let kernel_phys_start = boot_info.kernel_addr;
    let kernel_phys_end = kernel_phys_start + boot_info.kernel_len;

    crate::mm::init(
        phys_mem_offset,
        &boot_info.memory_regions,
        kernel_phys_start,
        kernel_phys_end,
        DEFAULT_HEAP_SIZE,
    );

    if let Some(rsdp_addr) = boot_info.rsdp_addr.into_option() {
        if let Err(e) = super::acpi::init(rsdp_addr) {
            log::warn!("ACPI init failed: {e}, assuming single-CPU system");
        }
    } else {
        log::warn!("bootloader did not report RSDP address, assuming single-CPU system");
    }

    crate::_start()
}
