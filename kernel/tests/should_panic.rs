//! `should_panic`-style integration test: the only way this test can pass
//! is by reaching its own panic handler, which is wired to report success
//! rather than failure. If the assertion below ever stops panicking, the
//! run times out and the harness reports a failure instead of a false pass.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use nova_kernel::mm::FrameNumber;
use nova_kernel::{exit_qemu, serial_println, QemuExitCode};

entry_point!(kernel_test_main);

fn kernel_test_main(_boot_info: &'static mut BootInfo) -> ! {
    serial_println!("should_panic::out_of_bounds_frame...");
    assert_eq!(FrameNumber::from_addr(0).addr(), 0x1000);
    serial_println!("[test did not panic]");
    exit_qemu(QemuExitCode::Failed)
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success)
}
