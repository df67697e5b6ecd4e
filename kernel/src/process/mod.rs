//! Process table.
//!
//! A `Task` is deliberately thin: just enough identity and address-space
//! ownership for `getpid` and for `mm_context` lookups during a page fault
//! or `mmap`/`munmap`/`brk` syscall. Scheduling, exec, fork, and signals are
//! out of scope — see [`crate::sched`] for the minimal run loop that
//! consumes `current_task`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::vma::MmContext;
use crate::mm::FrameNumber;

/// Process ID. PID 0 is never assigned; PID 1 is the first task created by
/// [`init`].
pub type Pid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Running,
    Blocked,
    Zombie,
}

/// A schedulable unit of execution and its address-space ownership.
pub struct Task {
    pub pid: Pid,
    pub state: TaskState,
    /// Saved register/stack-pointer context, opaque to this module; written
    /// and read only by the context-switch path.
    pub saved_context_ptr: u64,
    /// Top of this task's kernel-mode stack, loaded into the GDT's TSS RSP0
    /// slot whenever this task is scheduled.
    pub kernel_stack_top: u64,
    /// Top of this task's user-mode stack at creation time.
    pub user_stack_top: u64,
    /// Ring 0 tasks (kernel threads) skip the privilege-level checks that
    /// ordinary user tasks go through in the syscall dispatcher.
    pub elevated: bool,
    /// APIC ID of the CPU this task is pinned to, if any.
    pub cpu_affinity: Option<u8>,
    pub mm: Arc<MmContext>,
}

impl Task {
    fn new(pid: Pid, mm: Arc<MmContext>) -> Self {
        Self {
            pid,
            state: TaskState::Runnable,
            saved_context_ptr: 0,
            kernel_stack_top: 0,
            user_stack_top: 0,
            elevated: false,
            cpu_affinity: None,
            mm,
        }
    }
}

static NEXT_PID: Mutex<Pid> = Mutex::new(1);
static TASKS: Mutex<BTreeMap<Pid, Arc<Mutex<Task>>>> = Mutex::new(BTreeMap::new());

/// Per-CPU "currently running task" slot, indexed by dense `cpu_index`.
/// `None` until a task has actually been scheduled onto that CPU.
static CURRENT: [Mutex<Option<Pid>>; crate::arch::x86_64::gdt::MAX_CPUS] =
    [const { Mutex::new(None) }; crate::arch::x86_64::gdt::MAX_CPUS];

fn alloc_pid() -> Pid {
    let mut next = NEXT_PID.lock();
    let pid = *next;
    *next += 1;
    pid
}

/// Create a new task with its own address space rooted at `root`, heap
/// starting at `heap_start`. Returns the assigned PID.
pub fn create_task(root: FrameNumber, heap_start: u64) -> Pid {
    let pid = alloc_pid();
    let mm = Arc::new(MmContext::new(root, heap_start));
    TASKS
        .lock()
        .insert(pid, Arc::new(Mutex::new(Task::new(pid, mm))));
    pid
}

/// Look up a task by PID.
pub fn get_task(pid: Pid) -> KernelResult<Arc<Mutex<Task>>> {
    TASKS
        .lock()
        .get(&pid)
        .cloned()
        .ok_or(KernelError::NotFound {
            resource: "task",
            id: pid,
        })
}

/// Remove a task from the table. The caller is responsible for having
/// already torn down anything the task held (address space, open files).
pub fn remove_task(pid: Pid) -> KernelResult<()> {
    TASKS
        .lock()
        .remove(&pid)
        .map(|_| ())
        .ok_or(KernelError::NotFound {
            resource: "task",
            id: pid,
        })
}

/// Record which task is running on `cpu_index`. Called by the scheduler at
/// every context switch.
pub fn set_current(cpu_index: usize, pid: Option<Pid>) {
    *CURRENT[cpu_index].lock() = pid;
}

/// PID of the task currently running on `cpu_index`, if any.
pub fn current_pid(cpu_index: usize) -> Option<Pid> {
    *CURRENT[cpu_index].lock()
}

/// The task currently running on `cpu_index`.
pub fn current_task(cpu_index: usize) -> KernelResult<Arc<Mutex<Task>>> {
    let pid = current_pid(cpu_index).ok_or(KernelError::NotInitialized {
        subsystem: "current task",
    })?;
    get_task(pid)
}

/// Create PID 1, the first task, with a fresh empty address space rooted
/// at `root`. Called once during boot.
pub fn init(root: FrameNumber, heap_start: u64) -> Pid {
    create_task(root, heap_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_assigned_in_order() {
        let a = create_task(FrameNumber(0), 0);
        let b = create_task(FrameNumber(0), 0);
        assert!(b > a);
        remove_task(a).unwrap();
        remove_task(b).unwrap();
    }

    #[test]
    fn unknown_pid_is_not_found() {
        assert!(get_task(u64::MAX).is_err());
    }
}
