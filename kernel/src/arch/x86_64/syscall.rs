//! x86_64 system call entry point

#![allow(function_casts_as_integer)]

use crate::syscall::syscall_handler;

/// x86_64 SYSCALL instruction entry point
///
/// This function handles the transition from user mode to kernel mode
/// when a SYSCALL instruction is executed. It saves the user context,
/// switches to the kernel stack, and calls the system call handler.
///
/// # Safety
/// This function must only be called by the CPU's SYSCALL instruction.
/// It expects specific register states as defined by the x86_64 ABI.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        // Save user context on kernel stack
        "swapgs",                    // Switch to kernel GS
        "mov gs:[0x8], rsp",        // Save user RSP in per-CPU data
        "mov rsp, gs:[0x0]",        // Load kernel RSP from per-CPU data

        // Save registers
        "push rcx",                  // User RIP
        "push r11",                  // User RFLAGS
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",

        // Call syscall handler with proper arguments
        // rax = syscall number
        // rdi = arg1, rsi = arg2, rdx = arg3
        // r10 = arg4, r8 = arg5, r9 = arg6
        "mov rcx, r10",              // Move arg4 to rcx (ABI mismatch fix)
        "call {handler}",

        // Restore registers
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "pop r11",                   // User RFLAGS
        "pop rcx",                   // User RIP

        // Restore user stack and return
        "mov rsp, gs:[0x8]",        // Restore user RSP
        "swapgs",                    // Switch back to user GS
        "sysretq",

        handler = sym syscall_handler
    );
}

/// Program `IA32_STAR`/`IA32_LSTAR`/`IA32_FMASK` and set `EFER.SCE` so
/// `SYSCALL`/`SYSRET` work on this CPU. Selectors come from this CPU's own
/// GDT (`gdt::init` must already have run) rather than hardcoded values, so
/// this stays correct if the GDT layout ever moves.
pub fn init_syscall(cpu_index: usize) {
    use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
    use x86_64::registers::rflags::RFlags;

    let selectors = super::gdt::selectors(cpu_index);

    // SAFETY: writes well-known MSRs with selectors from this CPU's own
    // GDT; called once during this CPU's bring-up, before user mode runs.
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS);
        });

        LStar::write(x86_64::VirtAddr::new(syscall_entry as usize as u64));

        // Star::write(cs_sysret, ss_sysret, cs_syscall, ss_syscall): SYSRET
        // derives CS from cs_sysret directly and SS from cs_sysret - 8, so
        // cs_sysret must be the user code selector and ss_sysret the user
        // data selector (gdt.rs's 0x30/0x28 layout exists for exactly this).
        Star::write(
            selectors.user_code_selector,
            selectors.user_data_selector,
            selectors.code_selector,
            selectors.data_selector,
        )
        .expect("GDT layout violates SYSCALL/SYSRET selector constraints");

        // Mask IF on entry; the handler explicitly re-enables interrupts
        // once it has switched onto the kernel stack.
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
}
