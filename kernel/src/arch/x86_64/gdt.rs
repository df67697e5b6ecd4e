//! Per-CPU GDT and TSS.
//!
//! Each CPU (BSP and every AP) gets its own [`GlobalDescriptorTable`] and
//! [`TaskStateSegment`] so each can carry its own RSP0/IST stacks; the
//! selector layout is identical across CPUs and matches what `syscall.rs`
//! programs into `STAR`.
//!
//! Layout:
//! - 0x00: Null descriptor
//! - 0x08: Kernel code segment (Ring 0)
//! - 0x10: Kernel data segment (Ring 0)
//! - 0x18: TSS (occupies 2 entries, 0x18-0x20)
//! - 0x28: User data segment (Ring 3, selector 0x2B with RPL)
//! - 0x30: User code segment (Ring 3, selector 0x33 with RPL)
//!
//! The user data/code order matches SYSRET expectations: SYSRET computes
//! SS = STAR[63:48]+8, CS = STAR[63:48]+16.

extern crate alloc;

use alloc::boxed::Box;
use spin::Once;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Upper bound on concurrently bootstrapped CPUs; matches
/// [`super::ap_startup::MAX_CPUS`].
pub const MAX_CPUS: usize = 32;

const STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct AlignedStack([u8; STACK_SIZE]);

/// GDT segment selectors, identical across every CPU.
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
}

struct CpuGdt {
    gdt: GlobalDescriptorTable,
    selectors: Selectors,
    /// Raw pointer to the leaked TSS. `set_kernel_stack` needs mutable
    /// access to a structure the GDT descriptor also points at by address,
    /// which a `&'static mut` field can't give out from behind `&CpuGdt`.
    tss: *mut TaskStateSegment,
}

// SAFETY: `tss` points at a `Box::leak`'d allocation never freed or aliased
// outside this module; all access to it happens through `set_kernel_stack`/
// `get_kernel_stack` with interrupts disabled on the owning CPU.
unsafe impl Send for CpuGdt {}
unsafe impl Sync for CpuGdt {}

/// One slot per CPU, boxed behind `Once` so the GDT/TSS have a stable
/// address for the lifetime of the CPU once initialized.
static CPU_GDTS: [Once<CpuGdt>; MAX_CPUS] = [const { Once::new() }; MAX_CPUS];

fn build_cpu_gdt() -> CpuGdt {
    // Leaked per-CPU stacks: one double-fault IST stack and one RSP0 stack,
    // each reachable only through this CPU's TSS for the rest of the
    // kernel's lifetime.
    let rsp0: &'static mut AlignedStack = Box::leak(Box::new(AlignedStack([0; STACK_SIZE])));
    let ist1: &'static mut AlignedStack = Box::leak(Box::new(AlignedStack([0; STACK_SIZE])));

    // Leaked before the descriptor is built so its address is stable; the
    // GDT's TSS descriptor bakes in the base address at append() time and
    // must never see the TSS move afterwards.
    let tss: &'static mut TaskStateSegment = Box::leak(Box::new(TaskStateSegment::new()));
    tss.privilege_stack_table[0] = VirtAddr::from_ptr(rsp0.0.as_ptr()) + STACK_SIZE as u64;
    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
        VirtAddr::from_ptr(ist1.0.as_ptr()) + STACK_SIZE as u64;
    let tss_ptr: *mut TaskStateSegment = tss;

    let mut gdt = GlobalDescriptorTable::new();
    let code_selector = gdt.append(Descriptor::kernel_code_segment());
    let data_selector = gdt.append(Descriptor::kernel_data_segment());
    let tss_selector = gdt.append(Descriptor::tss_segment(tss));
    let user_data_selector = gdt.append(Descriptor::user_data_segment());
    let user_code_selector = gdt.append(Descriptor::user_code_segment());

    CpuGdt {
        gdt,
        selectors: Selectors {
            code_selector,
            data_selector,
            tss_selector,
            user_data_selector,
            user_code_selector,
        },
        tss: tss_ptr,
    }
}

/// Build, load, and activate this CPU's GDT and TSS. `cpu_index` is a dense
/// 0-based index (not the APIC ID); the BSP is always index 0.
pub fn init(cpu_index: usize) {
    use x86_64::instructions::segmentation::{Segment, CS, DS};
    use x86_64::instructions::tables::load_tss;

    let slot = &CPU_GDTS[cpu_index];
    let cpu_gdt = slot.call_once(build_cpu_gdt);

    cpu_gdt.gdt.load();
    // SAFETY: the GDT just loaded on this CPU contains descriptors at
    // exactly these selectors, built by `build_cpu_gdt` above.
    unsafe {
        CS::set_reg(cpu_gdt.selectors.code_selector);
        DS::set_reg(cpu_gdt.selectors.data_selector);
        load_tss(cpu_gdt.selectors.tss_selector);
    }
}

pub fn selectors(cpu_index: usize) -> &'static Selectors {
    &CPU_GDTS[cpu_index]
        .get()
        .expect("gdt::init not yet called for this CPU")
        .selectors
}

/// Update RSP0 in this CPU's TSS. Called during context switch to set the
/// stack used for Ring 3 -> Ring 0 transitions. Must run with interrupts
/// disabled.
pub fn set_kernel_stack(cpu_index: usize, stack_top: u64) {
    let cpu_gdt = CPU_GDTS[cpu_index]
        .get()
        .expect("gdt::init not yet called for this CPU");
    // SAFETY: called with interrupts disabled by the scheduler, so there is
    // no concurrent access to this CPU's own TSS.
    unsafe {
        (*cpu_gdt.tss).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

pub fn get_kernel_stack(cpu_index: usize) -> u64 {
    let cpu_gdt = CPU_GDTS[cpu_index]
        .get()
        .expect("gdt::init not yet called for this CPU");
    // SAFETY: reads a field no other CPU writes; this CPU only ever calls
    // this with interrupts disabled.
    unsafe { (*cpu_gdt.tss).privilege_stack_table[0].as_u64() }
}
