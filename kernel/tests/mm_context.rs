//! Exercises `mmap`/`munmap`/`brk` against a real, booted address space:
//! the frame allocator, page tables, and kernel heap are all live, not
//! mocked, so a bug in how VMAs are threaded onto the page-table engine
//! actually faults here instead of passing silently.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use nova_kernel::mm::page_table;
use nova_kernel::mm::vma::{MapFlags, MmContext, Prot, VmaKind};
use nova_kernel::mm::{PAGE_SIZE, USERSPACE_START};
use nova_kernel::{exit_qemu, serial_println, test_panic_handler, QemuExitCode};

entry_point!(kernel_test_main);

const DEFAULT_HEAP_SIZE: usize = 16 * 1024 * 1024;

fn kernel_test_main(boot_info: &'static mut BootInfo) -> ! {
    serial_println!("mm_context...");

    let phys_mem_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not map physical memory");
    let kernel_phys_start = boot_info.kernel_addr;
    let kernel_phys_end = kernel_phys_start + boot_info.kernel_len;

    nova_kernel::mm::init(
        phys_mem_offset,
        &boot_info.memory_regions,
        kernel_phys_start,
        kernel_phys_end,
        DEFAULT_HEAP_SIZE,
    );

    let root = page_table::current_page_table();
    let ctx = MmContext::new(root, USERSPACE_START);

    // A private anonymous mapping is zero-filled and readable/writable.
    let length = 4 * PAGE_SIZE as u64;
    let addr = ctx
        .mmap(0, length, Prot::READ | Prot::WRITE, MapFlags::PRIVATE | MapFlags::ANONYMOUS, VmaKind::Anonymous)
        .expect("mmap failed");
    assert!(addr >= USERSPACE_START);

    let vma = ctx.find_vma(addr).expect("mapped range has no VMA");
    assert_eq!(vma.start, addr);
    assert_eq!(vma.end, addr + length);

    // The page is actually mapped and zeroed: read it back through its
    // kernel alias rather than dereferencing the user address directly.
    let phys = page_table::get_physical_address(addr, root).expect("page not mapped");
    let virt = nova_kernel::mm::phys_to_virt(phys);
    // SAFETY: freshly allocated anonymous page, exclusively owned by this
    // test, read-only access of one byte.
    let byte = unsafe { core::ptr::read_volatile(virt as *const u8) };
    assert_eq!(byte, 0);

    // munmap tolerates unmapping a sub-range and leaves the rest in place.
    ctx.munmap(addr, PAGE_SIZE as u64).expect("munmap failed");
    assert!(ctx.find_vma(addr).is_none());
    assert!(ctx.find_vma(addr + PAGE_SIZE as u64).is_some());

    ctx.munmap(addr, length).expect("munmap of remainder failed");
    assert!(ctx.find_vma(addr + PAGE_SIZE as u64).is_none());

    // brk grows then shrinks the heap, mapping and unmapping as it goes.
    let heap_start = ctx.brk(0);
    assert_eq!(heap_start, USERSPACE_START);
    let grown = ctx.brk(heap_start + 3 * PAGE_SIZE as u64);
    assert_eq!(grown, heap_start + 3 * PAGE_SIZE as u64);
    let shrunk = ctx.brk(heap_start);
    assert_eq!(shrunk, heap_start);

    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}
