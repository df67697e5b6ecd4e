//! COM1 serial port: the sole console and logging sink.
//!
//! Unlike the scratch-port-per-call approach some kernels use, this keeps a
//! single [`uart_16550::SerialPort`] behind a spinlock so the logger and the
//! panic path share one initialized device rather than re-probing the UART
//! on every write.

use core::fmt::{self, Write};

use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts;

const COM1_BASE: u16 = 0x3F8;

static SERIAL1: Mutex<SerialPort> = {
    // SAFETY: 0x3F8 is the standard COM1 I/O base; constructing the port
    // does not touch hardware until `init()`/`write_str` is called.
    unsafe { Mutex::new(SerialPort::new(COM1_BASE)) }
};

/// Initialize the COM1 UART. Must run before any `print!`/`log` output.
pub fn init() {
    SERIAL1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    interrupts::without_interrupts(|| {
        SERIAL1.lock().write_fmt(args).ok();
    });
}

/// Write directly to the serial port, bypassing the `Mutex`.
///
/// Used exclusively by the panic path: if the panic was caused by a bug in
/// code holding `SERIAL1`'s lock, taking the lock here would deadlock.
/// This forges a second, unsynchronized handle to the same I/O ports,
/// which is safe only because the kernel is about to halt.
pub fn panic_print(args: fmt::Arguments) {
    // SAFETY: only reachable from the panic handler, which never returns;
    // no other code path constructs a SerialPort, so there is no real
    // concurrent access despite bypassing SERIAL1's lock.
    let mut port = unsafe { SerialPort::new(COM1_BASE) };
    let _ = port.write_fmt(args);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
