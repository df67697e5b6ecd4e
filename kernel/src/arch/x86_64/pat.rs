//! Page Attribute Table reprogramming.
//!
//! Runs once per CPU during early bring-up, before any page is mapped with
//! a PAT-dependent flag combination. Leaves PA0/PA1/PA3/PA5-PA7 at their
//! hardware reset encodings and reprograms only PA2 (uncacheable) and PA4
//! (write-combining) — the two memory types C3's PAT-aware flag bits
//! (`PCD`/`PWT` combinations) actually depend on.
//!
//! The reprogramming sequence is ordered exactly as below; reordering it is
//! a correctness bug (stale cache lines can be observed through the new
//! memory type if the cache isn't flushed before the PAT MSR write takes
//! effect).

use x86_64::instructions::interrupts;
use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};

use super::msr::{rdmsr, wrmsr};

const IA32_PAT: u32 = 0x277;

/// PAT entry encodings (Table 11-10, Intel SDM vol. 3A).
const PA_UC: u64 = 0x00;
const PA_WC: u64 = 0x01;

/// Reprogram PA2 to uncacheable and PA4 to write-combining.
///
/// # Safety
/// Must run with exclusive control of this CPU's caches and control
/// registers — typically once, early in per-CPU bring-up, before any other
/// code on this CPU depends on the PAT's prior state.
pub unsafe fn init() {
    if !cpu_has_pat() {
        return;
    }

    interrupts::without_interrupts(|| {
        // SAFETY: caller guarantees exclusive access to control registers on
        // this CPU; this sequence is the documented safe procedure for
        // changing memory type encodings without leaving stale, differently
        // cached aliases of the same physical page visible to later code.
        unsafe {
            Cr0::update(|flags| flags.insert(Cr0Flags::CACHE_DISABLE));
            wbinvd();
            Cr4::update(|flags| flags.remove(Cr4Flags::PAGE_GLOBAL));

            let mut pat = rdmsr(IA32_PAT);
            pat = set_entry(pat, 2, PA_UC);
            pat = set_entry(pat, 4, PA_WC);
            wrmsr(IA32_PAT, pat);

            wbinvd();
            Cr0::update(|flags| flags.remove(Cr0Flags::CACHE_DISABLE));
            Cr4::update(|flags| flags.insert(Cr4Flags::PAGE_GLOBAL));
        }
    });
}

fn cpu_has_pat() -> bool {
    let edx: u32;
    // SAFETY: CPUID leaf 1 is read-only and side-effect-free. RBX is
    // saved/restored because LLVM reserves it as a frame pointer under
    // some codegen configurations.
    unsafe {
        core::arch::asm!(
            "push rbx",
            "mov eax, 1",
            "cpuid",
            "pop rbx",
            out("edx") edx,
            out("eax") _,
            out("ecx") _,
            options(nomem, preserves_flags),
        );
    }
    (edx & (1 << 16)) != 0
}

fn set_entry(pat: u64, index: u32, encoding: u64) -> u64 {
    let shift = index * 8;
    (pat & !(0xFFu64 << shift)) | (encoding << shift)
}

/// # Safety
/// Writes back and invalidates every cache on this CPU; callers must not
/// rely on cached state surviving the call.
unsafe fn wbinvd() {
    // SAFETY: `wbinvd` has no memory operands to validate; it is a
    // privileged instruction the caller has already established the right
    // to execute (ring 0, interrupts disabled).
    unsafe {
        core::arch::asm!("wbinvd", options(nomem, nostack));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_entry_touches_only_its_byte() {
        let pat = 0x0007_0406_0007_0406u64;
        let updated = set_entry(pat, 2, PA_UC);
        assert_eq!((updated >> 16) & 0xFF, PA_UC);
        assert_eq!(updated & 0xFF, pat & 0xFF);
        assert_eq!((updated >> 32) & 0xFF, (pat >> 32) & 0xFF);
    }
}
