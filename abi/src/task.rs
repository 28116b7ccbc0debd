//! Task ABI: identifiers, scheduling states, priorities, and resource limits.

pub const MAX_TASKS: usize = 64;
pub const INVALID_TASK_ID: u32 = 0;
pub const INIT_TASK_ID: u32 = 1;

pub const TASK_NAME_MAX_LEN: usize = 32;

/// Scheduling policies.
pub const SCHED_OTHER: u32 = 0;
pub const SCHED_FIFO: u32 = 1;
pub const SCHED_RR: u32 = 2;

/// Priority bands. Lower numeric value is served first.
pub const PRIO_HIGHEST: u8 = 0;
pub const PRIO_DEFAULT: u8 = 4;
pub const PRIO_LOWEST: u8 = 7;
pub const NR_PRIO_LEVELS: usize = 8;

pub const DEFAULT_TIMESLICE_TICKS: u64 = 10;

/// Scheduler state of a task. A task is in exactly one of these.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot unused.
    Invalid = 0,
    /// Currently executing on a CPU.
    Running = 1,
    /// On a ready queue.
    Ready = 2,
    /// Interruptible sleep on a wait channel.
    Sleeping = 3,
    /// Uninterruptible sleep on a wait channel.
    Waiting = 4,
    /// Stopped by job control.
    Stopped = 5,
    /// Exited, waiting for the parent to reap.
    Zombie = 6,
    /// The per-CPU idle task.
    Idle = 7,
}

impl TaskState {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Ready,
            3 => Self::Sleeping,
            4 => Self::Waiting,
            5 => Self::Stopped,
            6 => Self::Zombie,
            7 => Self::Idle,
            _ => Self::Invalid,
        }
    }
}

// ---------------------------------------------------------------------------
// Task property flags (a one-word flag register on the task)
// ---------------------------------------------------------------------------

/// A signal handler frame is live on the user stack.
pub const PROPERTY_HANDLING_SIG: u32 = 1 << 0;
/// The task is blocked inside one of the wait*() calls.
pub const PROPERTY_IN_WAIT: u32 = 1 << 1;
/// Created by vfork; shared-memory attachments survive exit/exec.
pub const PROPERTY_VFORK: u32 = 1 << 2;
/// The task runs user code (kernel service tasks never receive signals).
pub const PROPERTY_USER: u32 = 1 << 3;
/// The task's last stop/continue transition was reported via wait*().
pub const PROPERTY_STATUS_REPORTED: u32 = 1 << 4;

// ---------------------------------------------------------------------------
// Resource limits
// ---------------------------------------------------------------------------

pub const RLIMIT_CPU: usize = 0;
pub const RLIMIT_FSIZE: usize = 1;
pub const RLIMIT_DATA: usize = 2;
pub const RLIMIT_STACK: usize = 3;
pub const RLIMIT_CORE: usize = 4;
pub const RLIMIT_NOFILE: usize = 7;
pub const RLIMIT_NPROC: usize = 6;
pub const RLIM_NLIMITS: usize = 16;

pub const RLIM_INFINITY: u64 = u64::MAX;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RLimit {
    pub rlim_cur: u64,
    pub rlim_max: u64,
}

impl RLimit {
    pub const fn unlimited() -> Self {
        Self {
            rlim_cur: RLIM_INFINITY,
            rlim_max: RLIM_INFINITY,
        }
    }
}

/// waitpid options.
pub const WNOHANG: u32 = 1;
pub const WUNTRACED: u32 = 2;
pub const WCONTINUED: u32 = 8;
