//! Core library for a small x86_64 research kernel: boot memory discovery,
//! physical frame allocation, paging, a kernel heap, per-process virtual
//! memory areas, and CPU/interrupt bring-up. Everything above that layer
//! (filesystems, drivers, networking, a real scheduler) is out of scope.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", test_runner(crate::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

#[cfg(feature = "alloc")]
extern crate alloc;

// Bare-metal target: the from-scratch header-based free-list heap backs
// the global allocator. Host target (plain `cargo test`): fall back to the
// system allocator so Vec/String/Arc work in ordinary unit tests.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelHeap = mm::heap::KernelHeap;

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod error;
#[cfg(target_os = "none")]
pub mod intrinsics;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod process;
pub mod raii;
pub mod sched;
pub mod serial;
pub mod syscall;

mod test_framework;

pub use mm::{FrameNumber, PAGE_SIZE};
#[cfg(test)]
pub use test_framework::test_runner;
pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};

/// Boot entry point, called from `arch::x86_64::boot::kernel_main` once
/// `mm::init` and ACPI discovery have run.
#[cfg(target_os = "none")]
pub fn _start() -> ! {
    let config = config::BootConfig::default();
    logger::init(config.log_level);
    serial::init();

    arch::x86_64::init(0);
    log::info!("arch bring-up complete");

    if let Err(e) = arch::x86_64::apic::init() {
        log::warn!("APIC init failed: {e}");
    }

    let root = mm::page_table::current_page_table();

    if config.smp_enabled {
        match arch::x86_64::ap_startup::init(root) {
            Ok(count) => log::info!("smp: {count} CPU(s) online"),
            Err(e) => log::warn!("smp: AP bring-up skipped: {e}"),
        }
    }

    arch::x86_64::enable_interrupts();

    let pid = process::init(root, mm::USERSPACE_START);
    log::info!("pid {pid} created");

    #[cfg(test)]
    test_main();

    sched::run(0, pid);
}

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a `no_std` kernel is
/// unrecoverable. The `alloc_error_handler` ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
