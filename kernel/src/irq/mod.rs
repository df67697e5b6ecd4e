//! Architecture-independent IRQ dispatch.
//!
//! A fixed 64-entry table indexed by IRQ line, each slot holding a handler
//! function pointer, an opaque cookie passed to it, and whether the LAPIC
//! should be EOI'd before (`fast_eoi`) or after the handler runs. No heap
//! allocation: the table is sized once at compile time, matching the fixed
//! IRQ range x86_64's IDT actually routes (vectors 32-95, see
//! [`crate::arch::x86_64::idt`]).

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Architecture-independent IRQ number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqNumber(pub u32);

impl IrqNumber {
    pub const fn new(irq: u32) -> Self {
        Self(irq)
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for IrqNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for IrqNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IRQ#{}", self.0)
    }
}

/// Handler signature: receives the opaque cookie registered alongside it,
/// not the IRQ number, so a single handler fn can serve several lines.
pub type IrqHandler = fn(cookie: usize);

/// Number of IRQ lines the table covers (0..63, i.e. IDT vectors 32-95).
pub const MAX_IRQ: usize = 64;

#[derive(Clone, Copy)]
struct IrqEntry {
    handler: Option<IrqHandler>,
    cookie: usize,
    /// If true, `eoi()` is sent to the LAPIC before the handler runs,
    /// allowing the handler to be preempted by a higher-priority IRQ.
    fast_eoi: bool,
}

impl IrqEntry {
    const fn empty() -> Self {
        Self {
            handler: None,
            cookie: 0,
            fast_eoi: false,
        }
    }
}

static TABLE: Mutex<[IrqEntry; MAX_IRQ]> = Mutex::new([IrqEntry::empty(); MAX_IRQ]);

/// Register `handler` for `irq`. Fails if a handler is already registered
/// or `irq` is out of range.
pub fn register_irq_handler(
    irq: IrqNumber,
    handler: IrqHandler,
    cookie: usize,
    fast_eoi: bool,
) -> KernelResult<()> {
    let index = irq.0 as usize;
    if index >= MAX_IRQ {
        return Err(KernelError::InvalidArgument {
            name: "irq",
            value: index,
        });
    }
    let mut table = TABLE.lock();
    if table[index].handler.is_some() {
        return Err(KernelError::AlreadyExists {
            resource: "irq_handler",
            id: irq.0 as u64,
        });
    }
    table[index] = IrqEntry {
        handler: Some(handler),
        cookie,
        fast_eoi,
    };
    Ok(())
}

/// Remove the handler registered for `irq`, if any.
pub fn unregister_irq_handler(irq: IrqNumber) -> KernelResult<()> {
    let index = irq.0 as usize;
    if index >= MAX_IRQ {
        return Err(KernelError::InvalidArgument {
            name: "irq",
            value: index,
        });
    }
    let mut table = TABLE.lock();
    if table[index].handler.take().is_none() {
        return Err(KernelError::NotFound {
            resource: "irq_handler",
            id: irq.0 as u64,
        });
    }
    Ok(())
}

/// Called from the IDT's IRQ entry stubs with the dense IRQ index (vector -
/// 32). Sends LAPIC EOI and invokes the registered handler, if any;
/// unregistered lines are silently treated as spurious.
pub fn dispatch(irq: IrqNumber) {
    let index = irq.0 as usize;
    if index >= MAX_IRQ {
        return;
    }
    let entry = TABLE.lock()[index];

    if entry.fast_eoi {
        crate::arch::x86_64::apic::send_eoi();
    }
    if let Some(handler) = entry.handler {
        handler(entry.cookie);
    }
    if !entry.fast_eoi {
        crate::arch::x86_64::apic::send_eoi();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn bump(cookie: usize) {
        CALLS.store(cookie, Ordering::SeqCst);
    }

    #[test]
    fn register_rejects_duplicate() {
        let irq = IrqNumber::new(10);
        register_irq_handler(irq, bump, 1, false).unwrap();
        assert!(register_irq_handler(irq, bump, 2, false).is_err());
        unregister_irq_handler(irq).unwrap();
    }

    #[test]
    fn unregister_unknown_fails() {
        assert!(unregister_irq_handler(IrqNumber::new(63)).is_err());
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(register_irq_handler(IrqNumber::new(64), bump, 0, false).is_err());
    }
}
