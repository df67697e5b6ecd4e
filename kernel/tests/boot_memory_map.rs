//! Boots under the real bootloader and checks that the boot-time memory map
//! it hands us normalizes into something sane: a sorted, non-degenerate set
//! of regions with at least a few MiB of conventional RAM free.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use nova_kernel::mm::boot_memory_map::BootMemoryMap;
use nova_kernel::{exit_qemu, serial_println, test_panic_handler, QemuExitCode};

entry_point!(kernel_test_main);

fn kernel_test_main(boot_info: &'static mut BootInfo) -> ! {
    serial_println!("boot_memory_map...");

    let map = BootMemoryMap::from_regions(&boot_info.memory_regions);

    assert!(map.total_memory() > 0, "memory map reported zero total memory");
    assert!(
        map.total_conventional() >= 16 * 1024 * 1024,
        "expected at least 16 MiB of conventional RAM under QEMU"
    );

    let entries = map.entries();
    assert!(!entries.is_empty());
    for pair in entries.windows(2) {
        assert!(
            pair[0].base <= pair[1].base,
            "entries are not sorted by base address"
        );
    }

    let largest = map
        .largest_conventional()
        .expect("no conventional region found");
    assert!(largest.length > 0);

    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}
