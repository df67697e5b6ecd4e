//! Binary entry point.
//!
//! The actual entry symbol is generated by `bootloader_api::entry_point!`
//! in [`nova_kernel::arch::x86_64::boot`]; this crate exists only to link
//! the library and supply the panic handler the final binary needs.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use nova_kernel as _;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    nova_kernel::serial::panic_print(format_args!("kernel panic: {info}\n"));
    nova_kernel::arch::x86_64::halt();
}
