//! Kernel error types.
//!
//! A single [`KernelError`] enum spans every error kind the core reports,
//! plus the infrastructural variants every subsystem needs regardless of
//! which component raised them. Internal functions propagate `KernelError`
//! with `?`; the only place it is ever turned into a raw integer is
//! [`KernelError::to_errno`], called exactly at the syscall boundary.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A physical or virtual allocation could not be satisfied.
    OutOfMemory { requested: usize, available: usize },
    /// A syscall or internal API argument was out of range or malformed.
    InvalidArgument { name: &'static str, value: usize },
    /// A lookup (VMA, frame, capability, process) failed.
    NotFound { resource: &'static str, id: u64 },
    /// An operation requires an object that already exists.
    AlreadyExists { resource: &'static str, id: u64 },
    /// A request named a real but unimplemented operation (e.g. a mmap flag
    /// combination this core does not support).
    UnsupportedOperation { operation: &'static str },
    /// A heap or page-table invariant was violated. Fatal: the only caller
    /// of this variant outside tests is the panic path.
    CorruptionDetected { detail: &'static str },
    /// An unrecoverable machine check or bus error was observed.
    BusError { address: usize },
    /// A subsystem was used before its `init()` ran.
    NotInitialized { subsystem: &'static str },
    /// A `spin::Mutex`/`RwLock` guard was poisoned by a panicking holder.
    LockPoisoned,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, available } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {:#x}", name, value)
            }
            Self::NotFound { resource, id } => write!(f, "{} {} not found", resource, id),
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} {} already exists", resource, id)
            }
            Self::UnsupportedOperation { operation } => {
                write!(f, "unsupported operation: {}", operation)
            }
            Self::CorruptionDetected { detail } => write!(f, "corruption detected: {}", detail),
            Self::BusError { address } => write!(f, "bus error at {:#x}", address),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::LockPoisoned => write!(f, "lock poisoned"),
        }
    }
}

impl KernelError {
    /// Translate to a negated POSIX errno, as required at the syscall
    /// boundary. Never called anywhere else in the kernel.
    pub fn to_errno(self) -> i32 {
        const ENOMEM: i32 = 12;
        const EINVAL: i32 = 22;
        const ENOENT: i32 = 2;
        const EEXIST: i32 = 17;
        const ENOSYS: i32 = 38;
        const EIO: i32 = 5;
        const EAGAIN: i32 = 11;

        let errno = match self {
            Self::OutOfMemory { .. } => ENOMEM,
            Self::InvalidArgument { .. } => EINVAL,
            Self::NotFound { .. } => ENOENT,
            Self::AlreadyExists { .. } => EEXIST,
            Self::UnsupportedOperation { .. } => ENOSYS,
            Self::CorruptionDetected { .. } | Self::BusError { .. } => EIO,
            Self::NotInitialized { .. } => EAGAIN,
            Self::LockPoisoned => EIO,
        };
        -errno
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_always_negative() {
        assert!(KernelError::OutOfMemory { requested: 4096, available: 0 }.to_errno() < 0);
        assert!(KernelError::NotFound { resource: "vma", id: 1 }.to_errno() < 0);
    }
}
