//! 16-bit real-mode AP trampoline.
//!
//! Every application processor starts executing here, in real mode, the
//! instant it receives the STARTUP IPI. Before it can touch any code linked
//! above 1 MiB it has to build its own path through protected mode into long
//! mode, using only the fixed low-memory addresses [`ap_startup`] stashed
//! values at ahead of time.
//!
//! [`ap_startup`]: super::ap_startup

use core::arch::global_asm;

/// Physical, page-aligned load address of the trampoline blob. Encoded as
/// the STARTUP IPI vector (`TRAMPOLINE_LOAD_ADDR >> 12`), so it must stay
/// below 1 MiB and page-aligned.
pub const TRAMPOLINE_LOAD_ADDR: u64 = 0x8000;

/// Physical address holding the 64-bit address the trampoline jumps to once
/// it reaches long mode (`ap_startup::ap_entry`, written here by the BSP).
pub const AP_ENTRY_PTR_ADDR: u64 = 0x9000;

/// Physical address of the kernel's top-level page table physical address,
/// copied here so the trampoline can load CR3 before it has any other way
/// to reach kernel data structures.
pub const AP_PAGE_TABLE_PTR_ADDR: u64 = 0x15000;

/// Physical address of a `u32` counter the trampoline increments the moment
/// it reaches long mode. Polled by [`ap_startup::boot_ap`] to detect whether
/// an AP came up.
///
/// [`ap_startup::boot_ap`]: super::ap_startup::boot_ap
pub const AP_RUNNING_COUNT_ADDR: u64 = 0x11000;

/// Physical address holding the dense `cpu_index` the BSP assigned this AP,
/// read back by `ap_startup::ap_entry` on the other side of the jump.
pub const AP_CPU_INDEX_ADDR: u64 = 0x11008;

// The blob below is position-dependent: it only runs correctly when copied
// to exactly `TRAMPOLINE_LOAD_ADDR`. Every intra-blob jump target is written
// as `label - ap_trampoline_start + TRAMPOLINE_LOAD_ADDR` for that reason.
global_asm!(
    ".section .rodata.ap_trampoline, \"a\"",
    ".global ap_trampoline_start",
    ".global ap_trampoline_end",
    "ap_trampoline_start:",
    ".code16",
    "cli",
    "xor ax, ax",
    "mov ds, ax",
    "mov es, ax",
    "mov ss, ax",
    "lgdt [ap_gdt_ptr - ap_trampoline_start + 0x8000]",
    "mov eax, cr0",
    "or eax, 1",
    "mov cr0, eax",
    "ljmp $0x08, $(ap_protected - ap_trampoline_start + 0x8000)",
    ".code32",
    "ap_protected:",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "mov ss, ax",
    // Enable PAE, point CR3 at the kernel's root page table, set LME, then
    // flip CR0.PG to enter IA-32e (compatibility) mode.
    "mov eax, cr4",
    "or eax, 1 << 5",
    "mov cr4, eax",
    "mov eax, [0x15000]",
    "mov cr3, eax",
    "mov ecx, 0xC0000080",
    "rdmsr",
    "or eax, 1 << 8",
    "wrmsr",
    "mov eax, cr0",
    "or eax, (1 << 31) | 1",
    "mov cr0, eax",
    "ljmp $0x18, $(ap_long - ap_trampoline_start + 0x8000)",
    ".code64",
    "ap_long:",
    "mov ax, 0x20",
    "mov ds, ax",
    "mov es, ax",
    "mov ss, ax",
    "lock add dword ptr [0x11000], 1",
    "mov rax, [0x9000]",
    "jmp rax",
    ".align 8",
    "ap_gdt_ptr:",
    ".word ap_gdt_end - ap_gdt - 1",
    ".quad ap_gdt - ap_trampoline_start + 0x8000",
    "ap_gdt:",
    ".quad 0",
    ".quad 0x00cf9a000000ffff", // 0x08: 32-bit flat code
    ".quad 0x00cf92000000ffff", // 0x10: 32-bit flat data
    ".quad 0x00af9a000000ffff", // 0x18: 64-bit code
    ".quad 0x00af92000000ffff", // 0x20: 64-bit data
    "ap_gdt_end:",
    "ap_trampoline_end:",
);

extern "C" {
    #[link_name = "ap_trampoline_start"]
    static TRAMPOLINE_START: u8;
    #[link_name = "ap_trampoline_end"]
    static TRAMPOLINE_END: u8;
}

/// Size in bytes of the assembled trampoline blob, computed from the linker
/// symbols the `global_asm!` block above defines.
pub fn trampoline_len() -> usize {
    // SAFETY: both symbols are link-time addresses with no associated
    // storage; only their addresses are read, never dereferenced.
    unsafe {
        (&TRAMPOLINE_END as *const u8 as usize) - (&TRAMPOLINE_START as *const u8 as usize)
    }
}

/// Address of the assembled trampoline blob in the kernel's own link image,
/// the source `ap_startup::prepare` copies from.
pub fn trampoline_src() -> *const u8 {
    // SAFETY: only the address is taken.
    unsafe { &TRAMPOLINE_START as *const u8 }
}
