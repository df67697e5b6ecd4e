//! `mmap`/`munmap`/`brk`/`getpid` syscall bodies.
//!
//! All four operate on the current task's [`crate::mm::vma::MmContext`];
//! argument validation beyond what `MmContext` itself enforces (e.g. the
//! `PROT_*`/`MAP_*` bit parsing below) lives here, at the ABI boundary.

use crate::error::{KernelError, KernelResult};
use crate::mm::vma::{MapFlags, Prot, VmaKind};
use crate::process;

pub const PROT_NONE: u32 = 0;
pub const PROT_READ: u32 = 1 << 0;
pub const PROT_WRITE: u32 = 1 << 1;
pub const PROT_EXEC: u32 = 1 << 2;

pub const MAP_SHARED: u32 = 1 << 0;
pub const MAP_PRIVATE: u32 = 1 << 1;
pub const MAP_FIXED: u32 = 1 << 4;
pub const MAP_ANONYMOUS: u32 = 1 << 5;

fn parse_prot(bits: u32) -> KernelResult<Prot> {
    const KNOWN: u32 = PROT_READ | PROT_WRITE | PROT_EXEC;
    if bits & !KNOWN != 0 {
        return Err(KernelError::InvalidArgument {
            name: "prot",
            value: bits as usize,
        });
    }
    let mut prot = Prot::empty();
    if bits & PROT_READ != 0 {
        prot |= Prot::READ;
    }
    if bits & PROT_WRITE != 0 {
        prot |= Prot::WRITE;
    }
    if bits & PROT_EXEC != 0 {
        prot |= Prot::EXEC;
    }
    Ok(prot)
}

fn parse_flags(bits: u32) -> KernelResult<MapFlags> {
    const KNOWN: u32 = MAP_SHARED | MAP_PRIVATE | MAP_FIXED | MAP_ANONYMOUS;
    if bits & !KNOWN != 0 {
        return Err(KernelError::InvalidArgument {
            name: "flags",
            value: bits as usize,
        });
    }
    let mut flags = MapFlags::empty();
    if bits & MAP_SHARED != 0 {
        flags |= MapFlags::SHARED;
    }
    if bits & MAP_PRIVATE != 0 {
        flags |= MapFlags::PRIVATE;
    }
    if bits & MAP_FIXED != 0 {
        flags |= MapFlags::FIXED;
    }
    if bits & MAP_ANONYMOUS != 0 {
        flags |= MapFlags::ANONYMOUS;
    }
    if !flags.contains(MapFlags::ANONYMOUS) {
        return Err(KernelError::UnsupportedOperation {
            operation: "file-backed mmap",
        });
    }
    Ok(flags)
}

// TODO: hardcoded to CPU 0 until per-CPU state gets a GS-based index; fine
// while `smp` stays off by default, wrong once APs actually schedule work.
fn current_mm() -> KernelResult<alloc::sync::Arc<crate::mm::vma::MmContext>> {
    let task = process::current_task(0)?;
    let mm = task.lock().mm.clone();
    Ok(mm)
}

pub fn sys_mmap(addr: u64, length: u64, prot_bits: u32, flags_bits: u32) -> KernelResult<u64> {
    let prot = parse_prot(prot_bits)?;
    let flags = parse_flags(flags_bits)?;
    let mm = current_mm()?;
    mm.mmap(addr, length, prot, flags, VmaKind::Anonymous)
}

pub fn sys_munmap(addr: u64, length: u64) -> KernelResult<u64> {
    let mm = current_mm()?;
    mm.munmap(addr, length)?;
    Ok(0)
}

pub fn sys_brk(new_end: u64) -> KernelResult<u64> {
    let mm = current_mm()?;
    Ok(mm.brk(new_end))
}

pub fn sys_getpid() -> KernelResult<u64> {
    process::current_pid(0).ok_or(KernelError::NotInitialized {
        subsystem: "current task",
    })
}
