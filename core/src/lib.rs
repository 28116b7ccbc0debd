#![cfg_attr(not(test), no_std)]

pub mod fault;
pub mod lifecycle;
pub mod memregion;
pub mod regs;
pub mod sched;
pub mod shm;
pub mod signal;
pub mod syscall;
pub mod task;
pub mod user_copy;

#[cfg(test)]
mod tests;

pub use regs::Regs;
pub use sched::{block_task, block_task2, cur_task, schedule, unblock_task, unblock_tasks};
pub use signal::{add_task_signal, check_pending_signals, user_add_task_signal};
pub use syscall::syscall_dispatcher;
pub use task::Task;

/// Bring the task layer up: wire the scheduler into the support-library
/// hooks and create the init task. The filesystem root must already be
/// mounted.
pub fn tasking_init() -> cinder_abi::errno::KResult<*mut Task> {
    sched::sched_register_services();
    lifecycle::task_create_init()
}
