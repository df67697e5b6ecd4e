//! Interrupt Descriptor Table.
//!
//! Exception vectors 0-31 get dedicated handlers; hardware IRQ vectors
//! 32-95 are generated by macro, each just forwarding its dense IRQ index
//! to [`crate::irq::dispatch`], which looks up the registered handler (if
//! any) and EOIs the Local APIC. Vector 0x80 is a legacy `int $0x80`
//! syscall gate at DPL=3, kept alongside the `syscall`/`sysret` fast path
//! for callers that still use the software interrupt.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::PrivilegeLevel;

use crate::irq::{self, IrqNumber};

/// First IDT vector routed to [`crate::irq::dispatch`].
pub const IRQ_BASE_VECTOR: usize = 32;

/// Legacy `int $0x80` syscall gate, kept for userspace built against older
/// ABI expectations; the fast path is the `syscall`/`sysret` MSR pair set
/// up in [`super::syscall::init_syscall`].
const SYSCALL_VECTOR: u8 = 0x80;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.divide_error.set_handler_fn(divide_error_handler);
        // SAFETY: the IST index names a stack set up by `gdt::init` on this
        // CPU before `idt::init` runs.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        install_irq_handlers(&mut idt);

        idt[SYSCALL_VECTOR as usize]
            .set_handler_fn(legacy_syscall_handler)
            .set_privilege_level(PrivilegeLevel::Ring3);

        idt
    };
}

macro_rules! irq_handler {
    ($name:ident, $index:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            irq::dispatch(IrqNumber::new($index));
        }
    };
}

// `paste`-free expansion: generate one named fn per IRQ index via a build
// script would be overkill here, so the 64 handlers are spelled out by a
// single repetition macro instead.
macro_rules! define_irq_handlers {
    ($( $n:literal => $fname:ident ),* $(,)?) => {
        $( irq_handler!($fname, $n); )*

        fn install_irq_handlers(idt: &mut InterruptDescriptorTable) {
            $( idt[IRQ_BASE_VECTOR + $n].set_handler_fn($fname); )*
        }
    };
}

define_irq_handlers! {
    0 => irq_handler_00, 1 => irq_handler_01, 2 => irq_handler_02, 3 => irq_handler_03,
    4 => irq_handler_04, 5 => irq_handler_05, 6 => irq_handler_06, 7 => irq_handler_07,
    8 => irq_handler_08, 9 => irq_handler_09, 10 => irq_handler_10, 11 => irq_handler_11,
    12 => irq_handler_12, 13 => irq_handler_13, 14 => irq_handler_14, 15 => irq_handler_15,
    16 => irq_handler_16, 17 => irq_handler_17, 18 => irq_handler_18, 19 => irq_handler_19,
    20 => irq_handler_20, 21 => irq_handler_21, 22 => irq_handler_22, 23 => irq_handler_23,
    24 => irq_handler_24, 25 => irq_handler_25, 26 => irq_handler_26, 27 => irq_handler_27,
    28 => irq_handler_28, 29 => irq_handler_29, 30 => irq_handler_30, 31 => irq_handler_31,
    32 => irq_handler_32, 33 => irq_handler_33, 34 => irq_handler_34, 35 => irq_handler_35,
    36 => irq_handler_36, 37 => irq_handler_37, 38 => irq_handler_38, 39 => irq_handler_39,
    40 => irq_handler_40, 41 => irq_handler_41, 42 => irq_handler_42, 43 => irq_handler_43,
    44 => irq_handler_44, 45 => irq_handler_45, 46 => irq_handler_46, 47 => irq_handler_47,
    48 => irq_handler_48, 49 => irq_handler_49, 50 => irq_handler_50, 51 => irq_handler_51,
    52 => irq_handler_52, 53 => irq_handler_53, 54 => irq_handler_54, 55 => irq_handler_55,
    56 => irq_handler_56, 57 => irq_handler_57, 58 => irq_handler_58, 59 => irq_handler_59,
    60 => irq_handler_60, 61 => irq_handler_61, 62 => irq_handler_62, 63 => irq_handler_63,
}

#[allow(dead_code)]
pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("breakpoint\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("double fault\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let addr = Cr2::read();
    log::error!(
        "page fault at {:?}, error={:?}\n{:#?}",
        addr,
        error_code,
        stack_frame
    );
    panic!("page fault");
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    log::error!(
        "general protection fault, error={:#x}\n{:#?}",
        error_code,
        stack_frame
    );
    panic!("general protection fault");
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    panic!("invalid opcode\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    panic!("divide error\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn legacy_syscall_handler(_stack_frame: InterruptStackFrame) {
    // The registers carrying the syscall number and arguments are not part
    // of `InterruptStackFrame`; a real legacy gate would need a naked
    // trampoline like `syscall::syscall_entry` to read them off the raw
    // stack. Left unimplemented: no userspace program in scope issues
    // `int $0x80` instead of `syscall`.
    log::warn!("int 0x80 legacy syscall gate hit, ignoring");
}
