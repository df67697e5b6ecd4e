//! Syscall dispatch.
//!
//! Four syscalls: `mmap`, `munmap`, `brk`, `getpid`. Each handler returns a
//! [`crate::error::KernelResult<u64>`]; this module is the one place that
//! boundary gets crossed into the SysV-ABI-compatible `i64` userspace sees
//! (negative errno on failure, the raw Ok value otherwise).

mod memory;

use crate::error::KernelError;

pub const SYS_MMAP: u64 = 9;
pub const SYS_MUNMAP: u64 = 11;
pub const SYS_BRK: u64 = 12;
pub const SYS_GETPID: u64 = 39;

/// Entry point called from the `syscall`/`sysret` trampoline in
/// `arch::x86_64::syscall::syscall_entry`, and from the legacy `int $0x80`
/// gate once it grows a real argument-reading path.
///
/// Register convention matches the Linux x86_64 ABI: `nr` in rax, `a0..a3`
/// in rdi/rsi/rdx/r10.
pub extern "C" fn syscall_handler(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    match dispatch(nr, a0, a1, a2, a3) {
        Ok(value) => value as i64,
        Err(e) => e.to_errno() as i64,
    }
}

fn dispatch(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64) -> Result<u64, KernelError> {
    match nr {
        SYS_MMAP => memory::sys_mmap(a0, a1, a2 as u32, a3 as u32),
        SYS_MUNMAP => memory::sys_munmap(a0, a1),
        SYS_BRK => memory::sys_brk(a0),
        SYS_GETPID => memory::sys_getpid(),
        _ => Err(KernelError::UnsupportedOperation {
            operation: "unknown syscall number",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscall_is_unsupported() {
        assert!(dispatch(0xFFFF, 0, 0, 0, 0).is_err());
    }
}
