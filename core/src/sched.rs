//! Scheduler: ready queues, the per-CPU current task, and the wait-channel
//! block/wake primitives everything above the task layer sleeps on.
//!
//! Queues are intrusive FIFO lists per priority band; the scheduler picks
//! the highest-priority ready task and resets its timeslice by policy.
//! Wakeups are level-triggered: posting a condition and then calling
//! `unblock_tasks(channel)` wakes every waiter, each of which re-checks
//! its condition.
//!
//! The actual CPU context switch is arch glue outside the substrate; the
//! `switch_seam` below is its hook. In its absence (early boot, hosted
//! test builds) a blocked task spins in `block_task`, which keeps the
//! semantics — sleep until the channel fires, a signal lands, or the
//! timeout passes — observable without hardware.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use cinder_abi::errno::Errno;
use cinder_abi::signal::{SIG_IGN, SIG_UNCATCHABLE, sig_bit};
use cinder_abi::task::{
    DEFAULT_TIMESLICE_TICKS, NR_PRIO_LEVELS, SCHED_FIFO, SCHED_RR, TaskState,
};
use cinder_lib::clock::ticks;
use cinder_lib::cpu::{MAX_CPUS, cpu_id, relax};
use cinder_lib::services;

use crate::task::{Task, task_iterate_active};

struct ReadyQueue {
    head: *mut Task,
    tail: *mut Task,
}

impl ReadyQueue {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }
}

struct SchedState {
    queues: [ReadyQueue; NR_PRIO_LEVELS],
}

unsafe impl Send for SchedState {}

static SCHED: cinder_lib::IrqMutex<SchedState> = cinder_lib::IrqMutex::new(SchedState {
    queues: [const { ReadyQueue::new() }; NR_PRIO_LEVELS],
});

static CURRENT: [AtomicPtr<Task>; MAX_CPUS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS];

/// The task executing on this CPU (null before tasking is up).
#[inline]
pub fn cur_task() -> *mut Task {
    CURRENT[cpu_id()].load(Ordering::Acquire)
}

pub fn set_cur_task(task: *mut Task) {
    CURRENT[cpu_id()].store(task, Ordering::Release);
    if !task.is_null() {
        unsafe { (*task).set_state(TaskState::Running) };
    }
}

fn enqueue_locked(state: &mut SchedState, task: *mut Task) {
    let prio = unsafe { (*task).priority } as usize % NR_PRIO_LEVELS;
    let q = &mut state.queues[prio];
    unsafe {
        (*task).next_ready = ptr::null_mut();
        if q.tail.is_null() {
            q.head = task;
        } else {
            (*q.tail).next_ready = task;
        }
        q.tail = task;
    }
}

/// Put a task on its priority band's ready queue.
pub fn enqueue_ready(task: *mut Task) {
    if task.is_null() {
        return;
    }
    unsafe { (*task).set_state(TaskState::Ready) };
    let mut state = SCHED.lock();
    enqueue_locked(&mut state, task);
}

/// Pop the highest-priority ready task, if any. Entries whose task left
/// the Ready state while queued (killed, woken elsewhere) are discarded.
pub fn scheduler_pick_next() -> *mut Task {
    let mut state = SCHED.lock();
    for qi in 0..NR_PRIO_LEVELS {
        loop {
            let q = &mut state.queues[qi];
            if q.head.is_null() {
                break;
            }
            let task = q.head;
            unsafe {
                q.head = (*task).next_ready;
                if q.head.is_null() {
                    q.tail = ptr::null_mut();
                }
                (*task).next_ready = ptr::null_mut();
                if (*task).state() != TaskState::Ready {
                    continue;
                }
            }
            return task;
        }
    }
    ptr::null_mut()
}

fn timeslice_for(task: *mut Task) -> u64 {
    match unsafe { (*task).policy } {
        SCHED_FIFO => u64::MAX,
        SCHED_RR => DEFAULT_TIMESLICE_TICKS,
        _ => DEFAULT_TIMESLICE_TICKS,
    }
}

/// Pick and dispatch the next ready task. The previous task, if still
/// runnable, goes back to its queue. Returns the task now current.
pub fn schedule() -> *mut Task {
    let prev = cur_task();
    let next = scheduler_pick_next();

    if next.is_null() {
        // Nothing else to run; the current task (or the idle loop) keeps
        // the CPU.
        return prev;
    }

    if !prev.is_null() && prev != next && unsafe { (*prev).state() } == TaskState::Running {
        enqueue_ready(prev);
    }

    unsafe {
        (*next).time_slice_left = timeslice_for(next);
        (*next).set_state(TaskState::Running);
    }
    CURRENT[cpu_id()].store(next, Ordering::Release);

    // Arch context switch would happen here; the register state of `prev`
    // is already parked in its trap frame.
    next
}

/// Timer-tick hook: burn the current task's timeslice and round-robin it
/// when exhausted.
pub fn scheduler_tick() {
    cinder_lib::clock::clock_tick();
    let task = cur_task();
    if task.is_null() {
        return;
    }
    let t = unsafe { &mut *task };
    if t.policy == SCHED_FIFO {
        return;
    }
    if t.time_slice_left > 0 {
        t.time_slice_left -= 1;
    }
    if t.time_slice_left == 0 {
        t.time_slice_left = timeslice_for(task);
        schedule();
    }
}

// ---------------------------------------------------------------------------
// Blocking and wakeup
// ---------------------------------------------------------------------------

/// Does this task have a pending signal that could break its sleep?
fn wake_signal_pending(task: &Task) -> bool {
    let pending = task.signal_pending.load(Ordering::Acquire);
    let deliverable = pending & (!task.signal_mask | SIG_UNCATCHABLE);
    deliverable != 0
}

fn block_common(channel: usize, interruptible: bool, timeout_ticks: u64) -> i32 {
    let task = cur_task();
    if task.is_null() {
        // No task context (early boot): behave as an immediate wakeup.
        relax();
        return 0;
    }
    let t = unsafe { &mut *task };

    let deadline = if timeout_ticks > 0 {
        ticks().saturating_add(timeout_ticks)
    } else {
        0
    };

    t.wait_channel.store(channel, Ordering::Release);
    t.wait_interruptible = interruptible;
    t.wait_timeout_at = deadline;
    t.set_state(if interruptible {
        TaskState::Sleeping
    } else {
        TaskState::Waiting
    });

    loop {
        match t.state() {
            TaskState::Ready | TaskState::Running => break,
            _ => {}
        }

        if interruptible && wake_signal_pending(t) {
            t.set_state(TaskState::Running);
            t.wait_channel.store(0, Ordering::Release);
            return Errno::EINTR.as_neg() as i32;
        }

        if deadline != 0 && ticks() >= deadline {
            t.set_state(TaskState::Running);
            t.wait_channel.store(0, Ordering::Release);
            return Errno::EAGAIN.as_neg() as i32;
        }

        // Hand the CPU away; with no other runnable task this degrades to
        // a polite spin.
        schedule();
        relax();
    }

    t.set_state(TaskState::Running);
    t.wait_channel.store(0, Ordering::Release);
    if t.woke_by_signal != 0 && interruptible {
        return Errno::EINTR.as_neg() as i32;
    }
    0
}

/// Sleep on `channel`. Interruptible sleeps return `-EINTR` when a signal
/// lands first.
pub fn block_task(channel: usize, interruptible: bool) -> i32 {
    block_common(channel, interruptible, 0)
}

/// Sleep on `channel` with a tick deadline: `-EWOULDBLOCK` on timeout,
/// `-EINTR` on signal, 0 on wakeup.
pub fn block_task2(channel: usize, timeout_ticks: u64) -> i32 {
    block_common(channel, true, timeout_ticks)
}

/// Wake every task sleeping on `channel` (level-triggered).
pub fn unblock_tasks(channel: usize) -> usize {
    let mut woken = 0;
    task_iterate_active(|task| {
        let t = unsafe { &*task };
        match t.state() {
            TaskState::Sleeping | TaskState::Waiting => {
                if t.wait_channel.load(Ordering::Acquire) == channel {
                    enqueue_ready(task);
                    woken += 1;
                }
            }
            _ => {}
        }
    });
    woken
}

/// Wake one specific task if it is asleep.
pub fn unblock_task(task: *mut Task) -> bool {
    if task.is_null() {
        return false;
    }
    let t = unsafe { &*task };
    match t.state() {
        TaskState::Sleeping | TaskState::Waiting | TaskState::Stopped => {
            enqueue_ready(task);
            true
        }
        _ => false,
    }
}

/// Interruptible sleeper wake path used by signal posting: records which
/// signal did the waking.
pub fn wake_for_signal(task: *mut Task, signum: u8) {
    let t = unsafe { &mut *task };
    if t.state() == TaskState::Sleeping {
        t.woke_by_signal = signum;
        enqueue_ready(task);
    }
}

// ---------------------------------------------------------------------------
// Service-hook registration
// ---------------------------------------------------------------------------

fn hook_current_task() -> u32 {
    let t = cur_task();
    if t.is_null() {
        cinder_abi::task::INVALID_TASK_ID
    } else {
        unsafe { (*t).pid }
    }
}

fn hook_block_on(channel: usize, interruptible: bool, timeout: u64) -> i32 {
    if timeout > 0 {
        block_task2(channel, timeout)
    } else {
        block_task(channel, interruptible)
    }
}

fn hook_unblock_all(channel: usize) -> usize {
    unblock_tasks(channel)
}

fn hook_fsize_limit() -> u64 {
    let t = cur_task();
    if t.is_null() {
        return u64::MAX;
    }
    unsafe { (*t).rlimits[cinder_abi::task::RLIMIT_FSIZE].rlim_cur }
}

fn hook_post_signal(signum: u8, code: i32, addr: u64) {
    let t = cur_task();
    if t.is_null() {
        return;
    }
    let mut info = cinder_abi::signal::SigInfo::zero();
    info.si_signo = signum as i32;
    info.si_code = code;
    info.si_addr = addr;
    let _ = crate::signal::add_task_signal(t, signum, Some(&info), true);
}

/// Wire the scheduler into the support-library hook table. Called once at
/// tasking init.
pub fn sched_register_services() {
    services::register_current_task(hook_current_task);
    services::register_block_on(hook_block_on);
    services::register_unblock_all(hook_unblock_all);
    services::register_fsize_limit(hook_fsize_limit);
    services::register_post_signal(hook_post_signal);
}

/// Is a signal currently deliverable to this sleeping task? Used by the
/// posting path to decide whether to wake it.
pub fn signal_would_wake(task: &Task, signum: u8) -> bool {
    if task.signal_mask & sig_bit(signum) != 0 {
        return false;
    }
    if task.sig.is_null() {
        return true;
    }
    let action = unsafe { &(*task.sig).actions[(signum - 1) as usize] };
    action.handler != SIG_IGN
}
