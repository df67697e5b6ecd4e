//! Local APIC support for x86_64.
//!
//! Provides initialization and control of the per-CPU Local APIC: timer
//! programming, End-Of-Interrupt signaling, and the INIT/STARTUP IPI
//! sequence used to bring up application processors. I/O APIC redirection
//! is out of scope; every interrupt source this kernel cares about (timer,
//! IPIs) is delivered and acknowledged entirely through the Local APIC.

use core::{
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::phys_to_virt;

use super::msr::{rdmsr, wrmsr};

// ---------------------------------------------------------------------------
// MSR addresses
// ---------------------------------------------------------------------------

/// IA32_APIC_BASE MSR address. Contains the APIC base physical address and
/// enable/BSP flags.
const IA32_APIC_BASE_MSR: u32 = 0x1B;

/// Bit 11 of IA32_APIC_BASE: global APIC enable.
const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;

// ---------------------------------------------------------------------------
// Local APIC register offsets (byte offsets from APIC base)
// ---------------------------------------------------------------------------

const LAPIC_ID: u32 = 0x020;
const LAPIC_VERSION: u32 = 0x030;
const LAPIC_TPR: u32 = 0x080;
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_LVT_LINT0: u32 = 0x350;
const LAPIC_LVT_LINT1: u32 = 0x360;
const LAPIC_LVT_ERROR: u32 = 0x370;
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
const LAPIC_TIMER_CUR_COUNT: u32 = 0x390;
const LAPIC_TIMER_DIV: u32 = 0x3E0;
const LAPIC_ICR_LOW: u32 = 0x300;
const LAPIC_ICR_HIGH: u32 = 0x310;

/// LVT mask bit (bit 16) -- when set, the interrupt is masked.
const LVT_MASK: u32 = 1 << 16;

/// Spurious Vector Register software enable bit (bit 8).
const SVR_ENABLE: u32 = 1 << 8;

/// Default spurious interrupt vector number (0xFF by convention).
const SPURIOUS_VECTOR: u8 = 0xFF;

/// Periodic timer mode (bits 18:17 = 01).
const TIMER_MODE_PERIODIC: u32 = 0b01 << 17;

// ---------------------------------------------------------------------------
// ICR delivery mode / level / trigger bits (bits 10:8, 14, 15)
// ---------------------------------------------------------------------------

const ICR_DELIVERY_INIT: u32 = 0b101 << 8;
const ICR_DELIVERY_STARTUP: u32 = 0b110 << 8;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_TRIGGER_LEVEL: u32 = 1 << 15;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;

// ---------------------------------------------------------------------------
// Local APIC
// ---------------------------------------------------------------------------

/// Local APIC controller.
///
/// Wraps the memory-mapped register file for the per-CPU Local APIC. All
/// register accesses use volatile reads/writes to prevent compiler reordering.
pub struct LocalApic {
    /// Virtual address of the APIC MMIO base.
    base: usize,
}

impl LocalApic {
    fn new(base: usize) -> Self {
        Self { base }
    }

    fn read(&self, offset: u32) -> u32 {
        let addr = self.base + offset as usize;
        // SAFETY: addr is a Local APIC MMIO register mapped by phys_to_virt.
        unsafe { ptr::read_volatile(addr as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        let addr = self.base + offset as usize;
        // SAFETY: addr is a Local APIC MMIO register mapped by phys_to_virt.
        unsafe { ptr::write_volatile(addr as *mut u32, value) }
    }

    pub fn read_id(&self) -> u8 {
        ((self.read(LAPIC_ID) >> 24) & 0xFF) as u8
    }

    #[allow(dead_code)]
    pub fn read_version(&self) -> u32 {
        self.read(LAPIC_VERSION)
    }

    fn enable(&self) {
        self.write(LAPIC_SVR, SVR_ENABLE | SPURIOUS_VECTOR as u32);
    }

    fn mask_all_lvt(&self) {
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
        self.write(LAPIC_LVT_LINT0, LVT_MASK);
        self.write(LAPIC_LVT_LINT1, LVT_MASK);
        self.write(LAPIC_LVT_ERROR, LVT_MASK);
    }

    pub fn send_eoi(&self) {
        self.write(LAPIC_EOI, 0);
    }

    fn set_task_priority(&self, priority: u8) {
        self.write(LAPIC_TPR, priority as u32);
    }

    /// Configure the APIC timer for periodic interrupts.
    pub fn setup_timer(&self, vector: u8, divide: u8, initial_count: u32) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_TIMER_DIV, divide as u32);
        self.write(LAPIC_LVT_TIMER, TIMER_MODE_PERIODIC | vector as u32);
        self.write(LAPIC_TIMER_INIT_COUNT, initial_count);
    }

    pub fn stop_timer(&self) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
    }

    #[allow(dead_code)]
    pub fn read_timer_count(&self) -> u32 {
        self.read(LAPIC_TIMER_CUR_COUNT)
    }

    /// Write the ICR to send a fixed-mode IPI carrying `vector`.
    pub fn send_ipi(&self, dest: u8, vector: u8) {
        self.write(LAPIC_ICR_HIGH, (dest as u32) << 24);
        self.write(LAPIC_ICR_LOW, vector as u32);
        self.wait_for_icr_idle();
    }

    /// Send the INIT IPI: level-triggered assert, no vector. First step of
    /// AP bring-up.
    pub fn send_init_ipi(&self, dest: u8) {
        self.write(LAPIC_ICR_HIGH, (dest as u32) << 24);
        self.write(
            LAPIC_ICR_LOW,
            ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT | ICR_TRIGGER_LEVEL,
        );
        self.wait_for_icr_idle();
    }

    /// Send the STARTUP IPI encoding the trampoline's page number
    /// (`trampoline_phys >> 12`) as the vector. Second step of AP bring-up,
    /// sent twice per the Intel MP spec.
    pub fn send_startup_ipi(&self, dest: u8, trampoline_page: u8) {
        self.write(LAPIC_ICR_HIGH, (dest as u32) << 24);
        self.write(
            LAPIC_ICR_LOW,
            ICR_DELIVERY_STARTUP | trampoline_page as u32,
        );
        self.wait_for_icr_idle();
    }

    fn wait_for_icr_idle(&self) {
        while self.read(LAPIC_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}

// ---------------------------------------------------------------------------
// Global APIC state
// ---------------------------------------------------------------------------

struct ApicState {
    local_apic: LocalApic,
}

// SAFETY: `local_apic.base` is a plain usize MMIO address; all access goes
// through `APIC_STATE`'s spinlock.
unsafe impl Send for ApicState {}

static APIC_STATE: Mutex<Option<ApicState>> = Mutex::new(None);
static APIC_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize this CPU's Local APIC: translate its MMIO base to a virtual
/// address, mask every LVT entry, then enable it via the spurious vector
/// register. Must run after GDT/IDT bring-up but before interrupts are
/// enabled. Called once per CPU (BSP and each AP).
pub fn init() -> KernelResult<()> {
    if APIC_INITIALIZED.load(Ordering::Acquire) {
        return Err(KernelError::AlreadyExists {
            resource: "apic",
            id: 0,
        });
    }

    let apic_base_msr = rdmsr(IA32_APIC_BASE_MSR);
    let apic_base_phys = apic_base_msr & 0xFFFF_F000;

    if apic_base_msr & IA32_APIC_BASE_ENABLE == 0 {
        wrmsr(IA32_APIC_BASE_MSR, apic_base_msr | IA32_APIC_BASE_ENABLE);
    }

    let lapic_virt = phys_to_virt(apic_base_phys) as usize;
    let lapic = LocalApic::new(lapic_virt);

    lapic.mask_all_lvt();
    lapic.enable();
    lapic.set_task_priority(0);

    log::info!(
        "LAPIC enabled: id={}, base={:#x}",
        lapic.read_id(),
        apic_base_phys
    );

    *APIC_STATE.lock() = Some(ApicState { local_apic: lapic });
    APIC_INITIALIZED.store(true, Ordering::Release);
    Ok(())
}

pub fn is_initialized() -> bool {
    APIC_INITIALIZED.load(Ordering::Acquire)
}

/// Send an End-Of-Interrupt to the Local APIC. Called once at the end of
/// every LAPIC-sourced interrupt handler.
pub fn send_eoi() {
    let state = APIC_STATE.lock();
    if let Some(ref s) = *state {
        s.local_apic.send_eoi();
    }
}

pub fn read_id() -> Option<u8> {
    APIC_STATE.lock().as_ref().map(|s| s.local_apic.read_id())
}

pub fn setup_timer(vector: u8, divide: u8, initial_count: u32) -> KernelResult<()> {
    match APIC_STATE.lock().as_ref() {
        Some(s) => {
            s.local_apic.setup_timer(vector, divide, initial_count);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "apic" }),
    }
}

pub fn stop_timer() -> KernelResult<()> {
    match APIC_STATE.lock().as_ref() {
        Some(s) => {
            s.local_apic.stop_timer();
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "apic" }),
    }
}

/// Send a fixed-mode IPI carrying `vector` to `dest`.
#[allow(dead_code)]
pub fn send_ipi(dest: u8, vector: u8) -> KernelResult<()> {
    match APIC_STATE.lock().as_ref() {
        Some(s) => {
            s.local_apic.send_ipi(dest, vector);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "apic" }),
    }
}

/// Send the INIT IPI to `dest`. Used only by [`super::ap_startup`].
pub fn send_init_ipi(dest: u8) -> KernelResult<()> {
    match APIC_STATE.lock().as_ref() {
        Some(s) => {
            s.local_apic.send_init_ipi(dest);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "apic" }),
    }
}

/// Send the STARTUP IPI to `dest`, encoding `trampoline_page`. Used only by
/// [`super::ap_startup`].
pub fn send_startup_ipi(dest: u8, trampoline_page: u8) -> KernelResult<()> {
    match APIC_STATE.lock().as_ref() {
        Some(s) => {
            s.local_apic.send_startup_ipi(dest, trampoline_page);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "apic" }),
    }
}
