//! Application-processor bring-up.
//!
//! Copies the real-mode trampoline into low memory, then walks the usable
//! APIC ID set from ACPI/MADT sending each core through the INIT-STARTUP-
//! STARTUP IPI sequence. Every brought-up AP calls back into [`ap_entry`],
//! which runs this CPU's share of [`super::init`] with its own dense
//! `cpu_index` before dropping into the idle loop.

use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::mm::{frame_allocator, phys_to_virt, FrameNumber};

use super::{acpi, apic, gdt, trampoline};

/// Upper bound on concurrently bootstrapped CPUs, matching [`gdt::MAX_CPUS`].
pub const MAX_CPUS: usize = gdt::MAX_CPUS;

/// Iterations of a spin-wait used as a fixed-cost delay between the INIT and
/// STARTUP IPIs, and while polling for an AP to report in. There is no
/// calibrated timer available this early in bring-up, so this is a crude
/// proxy for "a few milliseconds" rather than a wall-clock deadline.
const IPI_SPIN_ITERATIONS: u64 = 1_000_000;

/// Polling attempts before an AP is declared unresponsive.
const AP_READY_POLL_ATTEMPTS: u32 = 200;

fn spin_delay(iterations: u64) {
    for _ in 0..iterations {
        core::hint::spin_loop();
    }
}

fn write_phys_u64(phys: u64, value: u64) {
    let vaddr = phys_to_virt(phys) as *mut u64;
    // SAFETY: phys lies in the first 1 MiB, always identity-backed by the
    // direct physical mapping, and is exclusively owned by this function
    // during AP bring-up (no AP touches it before its STARTUP IPI arrives).
    unsafe { ptr::write_volatile(vaddr, value) };
}

fn read_phys_u32(phys: u64) -> u32 {
    let vaddr = phys_to_virt(phys) as *const u32;
    // SAFETY: see write_phys_u64; this address is only ever written by the
    // AP side after it reaches long mode, and read-only here.
    unsafe { ptr::read_volatile(vaddr) }
}

/// Acquire-load the AP running counter the trampoline increments with a
/// locked `add` (a release on x86: locked RMWs are full fences).
fn load_running_count() -> u32 {
    let vaddr = phys_to_virt(trampoline::AP_RUNNING_COUNT_ADDR) as *const AtomicU32;
    // SAFETY: vaddr is 4-byte aligned (AP_RUNNING_COUNT_ADDR is page-aligned)
    // and points at a `u32`-sized scratch cell no other non-atomic code
    // touches once `prepare` has run.
    unsafe { (*vaddr).load(Ordering::Acquire) }
}

/// Copy the trampoline blob and bring-up scratch values into the low-memory
/// addresses every AP reads before paging exists. Must run once, before the
/// first STARTUP IPI is sent.
fn prepare(root: FrameNumber) {
    frame_allocator::lock_page(FrameNumber::from_addr(trampoline::TRAMPOLINE_LOAD_ADDR));
    frame_allocator::lock_page(FrameNumber::from_addr(trampoline::AP_ENTRY_PTR_ADDR));
    frame_allocator::lock_page(FrameNumber::from_addr(trampoline::AP_RUNNING_COUNT_ADDR));
    frame_allocator::lock_page(FrameNumber::from_addr(trampoline::AP_PAGE_TABLE_PTR_ADDR));

    let dst = phys_to_virt(trampoline::TRAMPOLINE_LOAD_ADDR) as *mut u8;
    let src = trampoline::trampoline_src();
    let len = trampoline::trampoline_len();
    // SAFETY: dst is the direct-mapped alias of a frame just locked above,
    // large enough (one 4 KiB page) for any plausible trampoline blob; src
    // is the kernel's own linked-in copy.
    unsafe { ptr::copy_nonoverlapping(src, dst, len) };

    write_phys_u64(trampoline::AP_ENTRY_PTR_ADDR, ap_entry_trampoline as u64);
    write_phys_u64(trampoline::AP_PAGE_TABLE_PTR_ADDR, root.addr());
    write_phys_u64(trampoline::AP_RUNNING_COUNT_ADDR, 0);
}

/// Send the INIT-STARTUP-STARTUP sequence to one APIC ID and poll the
/// running counter for `expected_count` (this AP and every one started
/// before it). Returns whether the running counter reached that value
/// within the poll budget.
fn boot_one(apic_id: u8, cpu_index: usize, expected_count: u32) -> bool {
    write_phys_u64(trampoline::AP_CPU_INDEX_ADDR, cpu_index as u64);

    let trampoline_page = (trampoline::TRAMPOLINE_LOAD_ADDR >> 12) as u8;

    let _ = apic::send_init_ipi(apic_id);
    spin_delay(IPI_SPIN_ITERATIONS);

    let _ = apic::send_startup_ipi(apic_id, trampoline_page);
    spin_delay(IPI_SPIN_ITERATIONS);
    let _ = apic::send_startup_ipi(apic_id, trampoline_page);

    for _ in 0..AP_READY_POLL_ATTEMPTS {
        if load_running_count() >= expected_count {
            return true;
        }
        spin_delay(IPI_SPIN_ITERATIONS / 10);
    }
    false
}

/// Bring up every usable AP reported by ACPI/MADT. Must run after
/// [`acpi::init`], [`apic::init`], and [`crate::mm::init`] on the BSP.
/// No-op (and logs a warning) if ACPI found no MADT, since there is then no
/// reliable way to enumerate AP APIC IDs.
pub fn init(root: FrameNumber) -> KernelResult<usize> {
    let Some(apic_ids) = acpi::with_acpi_info(|info| info.usable_apic_ids().collect::<Vec<_>>())
    else {
        return Err(KernelError::NotInitialized { subsystem: "acpi" });
    };

    if apic_ids.len() <= 1 {
        log::info!("ap_startup: single-CPU system, nothing to bring up");
        return Ok(1);
    }

    prepare(root);

    let bsp_apic_id = apic::read_id().unwrap_or(0);
    let mut cpu_index = 1usize;
    let mut booted = 1usize;

    for apic_id in apic_ids.into_iter().filter(|&id| id != bsp_apic_id) {
        if cpu_index >= MAX_CPUS {
            log::warn!("ap_startup: MAX_CPUS reached, leaving apic_id {apic_id} parked");
            break;
        }

        if boot_one(apic_id, cpu_index, booted as u32) {
            log::info!("ap_startup: cpu {cpu_index} (apic_id {apic_id}) is up");
            cpu_index += 1;
            booted += 1;
        } else {
            log::warn!("ap_startup: apic_id {apic_id} did not respond, skipping");
        }
    }

    log::info!("ap_startup: {booted} CPU(s) running");
    Ok(booted)
}

/// Long-mode landing pad every AP jumps to out of the trampoline. Reads back
/// its assigned `cpu_index`, brings up its own GDT/IDT/PAT and LAPIC, then
/// hands off to the idle scheduler loop. Never returns.
///
/// # Safety
/// Must only ever be reached by the trampoline's final jump, with paging
/// already live via the page table this CPU shares with the BSP.
extern "C" fn ap_entry_trampoline() -> ! {
    let cpu_index = read_phys_u32(trampoline::AP_CPU_INDEX_ADDR) as usize;
    ap_entry(cpu_index)
}

fn ap_entry(cpu_index: usize) -> ! {
    super::init(cpu_index);

    if let Err(e) = apic::init() {
        log::warn!("cpu {cpu_index}: apic init failed: {e}");
    }
    super::enable_interrupts();

    log::info!("cpu {cpu_index}: online");
    loop {
        super::idle();
    }
}
