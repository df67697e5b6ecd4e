//! Minimal per-CPU run loop.
//!
//! Scheduling policy (run queues, preemption, priorities) is out of scope;
//! this just tracks which [`crate::process::Pid`] is "current" on each CPU
//! via [`crate::process::set_current`] and halts between interrupts when
//! there is nothing else to do.

/// Mark `pid` as running on this CPU and idle until the next interrupt.
/// Called once per CPU after bring-up completes.
pub fn run(cpu_index: usize, pid: crate::process::Pid) -> ! {
    crate::process::set_current(cpu_index, Some(pid));
    log::info!("cpu {cpu_index}: entering idle loop as pid {pid}");
    loop {
        crate::arch::x86_64::idle();
    }
}
