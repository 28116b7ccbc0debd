//! The task table and the per-task resource blocks.
//!
//! A task is the union of its identity, a memory map, a descriptor table,
//! filesystem anchors, and signal state. The four resource blocks are
//! separately reference-counted because threads of one group share them
//! while fork duplicates them.

use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::OPEN_MAX;
use cinder_abi::signal::{NSIG, SIG_DFL, SIG_EMPTY, SigAltStack, SigInfo, SigSet};
use cinder_abi::task::{
    DEFAULT_TIMESLICE_TICKS, INVALID_TASK_ID, MAX_TASKS, PRIO_DEFAULT, RLIM_NLIMITS, RLimit,
    SCHED_OTHER, TASK_NAME_MAX_LEN, TaskState,
};
use cinder_fs::fileio::{File, closef, file_ref};
use cinder_fs::node::{Node, node_ref, release_node};
use cinder_lib::{IrqMutex, klog_error};
use cinder_mm::paging::ProcessPageDir;
use cinder_mm::{kfree, kmalloc_zeroed};

use crate::memregion::MemRegion;
use crate::regs::Regs;

// ---------------------------------------------------------------------------
// Shared resource blocks
// ---------------------------------------------------------------------------

/// A task's virtual address space: the sorted region list plus the page
/// directory the regions are realized in.
#[repr(C)]
pub struct TaskVm {
    pub first_region: *mut MemRegion,
    pub last_region: *mut MemRegion,
    pub mutex: cinder_lib::KernelMutex,
    pub page_dir: *mut ProcessPageDir,
    /// Task size in pages.
    pub image_size: u64,
    pub end_data: u64,
    pub end_stack: u64,
    pub base_addr: u64,
    pub refs: AtomicU32,
}

/// The descriptor table shared by a thread group.
#[repr(C)]
pub struct TaskFiles {
    pub fd: [*mut File; OPEN_MAX],
    /// Close-on-exec bitmask, bit per descriptor slot.
    pub cloexec: u64,
    pub refs: AtomicU32,
}

/// Filesystem anchors.
#[repr(C)]
pub struct TaskFs {
    pub root: *mut Node,
    pub cwd: *mut Node,
    pub umask: u32,
    pub refs: AtomicU32,
}

/// Kernel-internal per-signal disposition.
#[derive(Copy, Clone)]
pub struct SigAction {
    /// SIG_DFL, SIG_IGN, or a user handler address.
    pub handler: u64,
    /// Mask OR'd into the blocked set while the handler runs.
    pub mask: SigSet,
    pub flags: u64,
    pub restorer: u64,
}

impl SigAction {
    pub const fn default() -> Self {
        Self {
            handler: SIG_DFL,
            mask: SIG_EMPTY,
            flags: 0,
            restorer: 0,
        }
    }
}

/// The per-signal action table shared by a thread group.
#[repr(C)]
pub struct TaskSig {
    pub actions: [SigAction; NSIG],
    pub refs: AtomicU32,
}

fn alloc_block<T>(init: impl FnOnce(&mut T)) -> *mut T {
    let p = kmalloc_zeroed(core::mem::size_of::<T>()) as *mut T;
    if !p.is_null() {
        init(unsafe { &mut *p });
    }
    p
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct Task {
    pub pid: u32,
    pub tgid: u32,
    pub pgid: u32,
    pub sid: u32,

    pub uid: u32,
    pub euid: u32,
    pub ssuid: u32,
    pub gid: u32,
    pub egid: u32,
    pub ssgid: u32,

    state: AtomicU8,
    pub policy: u32,
    pub priority: u8,
    pub time_slice: u64,
    pub time_slice_left: u64,

    /// Rendezvous address while sleeping; 0 when not blocked.
    pub wait_channel: AtomicUsize,
    pub wait_timeout_at: u64,
    pub wait_interruptible: bool,
    /// Signal number that broke an interruptible sleep.
    pub woke_by_signal: u8,

    pub parent: *mut Task,
    pub exit_status: i32,
    pub properties: u32,

    pub mem: *mut TaskVm,
    pub files: *mut TaskFiles,
    pub fs: *mut TaskFs,
    pub sig: *mut TaskSig,

    pub signal_pending: AtomicU64,
    pub signal_mask: SigSet,
    pub saved_sigmask: SigSet,
    pub signal_caught: SigSet,
    /// Signals armed by interval timers; their siginfo carries overruns.
    pub signal_timer: SigSet,
    pub siginfo: [SigInfo; NSIG],
    pub signal_stack: SigAltStack,
    /// Syscall number preserved across an interruptible sleep for
    /// transparent restart.
    pub interrupted_syscall: u64,

    /// The live trap frame while executing in kernel mode.
    pub regs: *mut Regs,
    /// The frame the task resumes user mode from (fork seeds the child's).
    pub kernel_regs: Regs,
    /// FXSAVE area.
    pub fpregs: [u8; 512],

    pub rlimits: [RLimit; RLIM_NLIMITS],

    pub user_time: u64,
    pub sys_time: u64,
    pub child_user_time: u64,
    pub child_sys_time: u64,

    pub name: [u8; TASK_NAME_MAX_LEN],
    pub next_ready: *mut Task,
}

unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    const fn invalid() -> Self {
        Self {
            pid: INVALID_TASK_ID,
            tgid: INVALID_TASK_ID,
            pgid: INVALID_TASK_ID,
            sid: INVALID_TASK_ID,
            uid: 0,
            euid: 0,
            ssuid: 0,
            gid: 0,
            egid: 0,
            ssgid: 0,
            state: AtomicU8::new(TaskState::Invalid.as_u8()),
            policy: SCHED_OTHER,
            priority: PRIO_DEFAULT,
            time_slice: DEFAULT_TIMESLICE_TICKS,
            time_slice_left: DEFAULT_TIMESLICE_TICKS,
            wait_channel: AtomicUsize::new(0),
            wait_timeout_at: 0,
            wait_interruptible: false,
            woke_by_signal: 0,
            parent: ptr::null_mut(),
            exit_status: 0,
            properties: 0,
            mem: ptr::null_mut(),
            files: ptr::null_mut(),
            fs: ptr::null_mut(),
            sig: ptr::null_mut(),
            signal_pending: AtomicU64::new(0),
            signal_mask: SIG_EMPTY,
            saved_sigmask: SIG_EMPTY,
            signal_caught: SIG_EMPTY,
            signal_timer: SIG_EMPTY,
            siginfo: [SigInfo::zero(); NSIG],
            signal_stack: SigAltStack::disabled(),
            interrupted_syscall: 0,
            regs: ptr::null_mut(),
            kernel_regs: Regs::zero(),
            fpregs: [0; 512],
            rlimits: [RLimit::unlimited(); RLIM_NLIMITS],
            user_time: 0,
            sys_time: 0,
            child_user_time: 0,
            child_sys_time: 0,
            name: [0; TASK_NAME_MAX_LEN],
            next_ready: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    #[inline]
    pub fn has_property(&self, bit: u32) -> bool {
        self.properties & bit != 0
    }
}

static mut TASK_TABLE: [Task; MAX_TASKS] = [const { Task::invalid() }; MAX_TASKS];
static TASK_LOCK: IrqMutex<()> = IrqMutex::new(());
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

fn tslot(i: usize) -> *mut Task {
    // SAFETY: i < MAX_TASKS at every call site.
    unsafe { ((&raw mut TASK_TABLE) as *mut Task).add(i) }
}

/// Allocate a task slot with a fresh pid.
pub fn task_alloc() -> KResult<*mut Task> {
    let _g = TASK_LOCK.lock();
    for i in 0..MAX_TASKS {
        let t = tslot(i);
        let r = unsafe { &mut *t };
        if r.state() == TaskState::Invalid {
            *r = Task::invalid();
            r.pid = NEXT_PID.fetch_add(1, Ordering::AcqRel);
            r.tgid = r.pid;
            r.pgid = r.pid;
            r.sid = r.pid;
            return Ok(t);
        }
    }
    klog_error!("task: table full");
    Err(Errno::EAGAIN)
}

pub fn task_find_by_id(pid: u32) -> *mut Task {
    if pid == INVALID_TASK_ID {
        return ptr::null_mut();
    }
    let _g = TASK_LOCK.lock();
    for i in 0..MAX_TASKS {
        let t = tslot(i);
        let r = unsafe { &*t };
        if r.pid == pid && r.state() != TaskState::Invalid {
            return t;
        }
    }
    ptr::null_mut()
}

/// Call `f` for every live task.
pub fn task_iterate_active(mut f: impl FnMut(*mut Task)) {
    for i in 0..MAX_TASKS {
        let t = tslot(i);
        if unsafe { (*t).state() } != TaskState::Invalid {
            f(t);
        }
    }
}

/// The init task: adoptive parent for orphans.
pub fn init_task() -> *mut Task {
    task_find_by_id(cinder_abi::task::INIT_TASK_ID)
}

/// Release a reaped task's slot.
pub fn task_free_slot(task: *mut Task) {
    let _g = TASK_LOCK.lock();
    unsafe { *task = Task::invalid() };
}

// ---------------------------------------------------------------------------
// Resource-block constructors / destructors
// ---------------------------------------------------------------------------

pub fn task_vm_alloc() -> *mut TaskVm {
    alloc_block(|vm: &mut TaskVm| {
        vm.page_dir = cinder_mm::paging::pagedir_alloc();
        vm.refs = AtomicU32::new(1);
    })
}

pub fn task_files_alloc() -> *mut TaskFiles {
    alloc_block(|tf: &mut TaskFiles| {
        tf.refs = AtomicU32::new(1);
    })
}

pub fn task_fs_alloc(root: *mut Node, cwd: *mut Node) -> *mut TaskFs {
    alloc_block(|tf: &mut TaskFs| {
        if !root.is_null() {
            node_ref(root);
        }
        if !cwd.is_null() {
            node_ref(cwd);
        }
        tf.root = root;
        tf.cwd = cwd;
        tf.umask = 0o022;
        tf.refs = AtomicU32::new(1);
    })
}

pub fn task_sig_alloc() -> *mut TaskSig {
    alloc_block(|ts: &mut TaskSig| {
        ts.actions = [SigAction::default(); NSIG];
        ts.refs = AtomicU32::new(1);
    })
}

pub fn task_files_put(tf: *mut TaskFiles) {
    if tf.is_null() {
        return;
    }
    let t = unsafe { &mut *tf };
    if t.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    for slot in t.fd.iter_mut() {
        if !slot.is_null() {
            closef(*slot);
            *slot = ptr::null_mut();
        }
    }
    kfree(tf as *mut u8);
}

pub fn task_fs_put(tf: *mut TaskFs) {
    if tf.is_null() {
        return;
    }
    let t = unsafe { &mut *tf };
    if t.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    if !t.root.is_null() {
        release_node(t.root);
    }
    if !t.cwd.is_null() {
        release_node(t.cwd);
    }
    kfree(tf as *mut u8);
}

pub fn task_sig_put(ts: *mut TaskSig) {
    if ts.is_null() {
        return;
    }
    let t = unsafe { &*ts };
    if t.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    kfree(ts as *mut u8);
}

/// Duplicate a descriptor table for fork: same files, counted again.
pub fn task_files_dup(src: *mut TaskFiles) -> *mut TaskFiles {
    let new = task_files_alloc();
    if new.is_null() || src.is_null() {
        return new;
    }
    let s = unsafe { &*src };
    let d = unsafe { &mut *new };
    for (i, f) in s.fd.iter().enumerate() {
        if !f.is_null() {
            file_ref(*f);
            d.fd[i] = *f;
        }
    }
    d.cloexec = s.cloexec;
    new
}

pub fn task_fs_dup(src: *mut TaskFs) -> *mut TaskFs {
    if src.is_null() {
        return ptr::null_mut();
    }
    let s = unsafe { &*src };
    task_fs_alloc(s.root, s.cwd)
}

pub fn task_sig_dup(src: *mut TaskSig) -> *mut TaskSig {
    let new = task_sig_alloc();
    if new.is_null() || src.is_null() {
        return new;
    }
    unsafe { (*new).actions = (*src).actions };
    new
}

// ---------------------------------------------------------------------------
// Descriptor-table helpers
// ---------------------------------------------------------------------------

/// Install a file into the lowest free descriptor slot at or above `from`.
pub fn fd_install(tf: *mut TaskFiles, file: *mut File, from: usize, cloexec: bool) -> KResult<i32> {
    let t = unsafe { &mut *tf };
    for i in from..OPEN_MAX {
        if t.fd[i].is_null() {
            t.fd[i] = file;
            if cloexec {
                t.cloexec |= 1 << i;
            } else {
                t.cloexec &= !(1 << i);
            }
            return Ok(i as i32);
        }
    }
    Err(Errno::EMFILE)
}

pub fn fd_get(tf: *mut TaskFiles, fd: i32) -> KResult<*mut File> {
    if tf.is_null() || fd < 0 || fd as usize >= OPEN_MAX {
        return Err(Errno::EBADF);
    }
    let f = unsafe { (*tf).fd[fd as usize] };
    if f.is_null() { Err(Errno::EBADF) } else { Ok(f) }
}

pub fn fd_close(tf: *mut TaskFiles, fd: i32) -> KResult<()> {
    if tf.is_null() || fd < 0 || fd as usize >= OPEN_MAX {
        return Err(Errno::EBADF);
    }
    let t = unsafe { &mut *tf };
    let f = t.fd[fd as usize];
    if f.is_null() {
        return Err(Errno::EBADF);
    }
    t.fd[fd as usize] = ptr::null_mut();
    t.cloexec &= !(1 << fd);
    closef(f);
    Ok(())
}

/// Close every descriptor marked close-on-exec.
pub fn fd_close_on_exec(tf: *mut TaskFiles) {
    if tf.is_null() {
        return;
    }
    let t = unsafe { &mut *tf };
    for i in 0..OPEN_MAX {
        if t.cloexec & (1 << i) != 0 && !t.fd[i].is_null() {
            closef(t.fd[i]);
            t.fd[i] = ptr::null_mut();
        }
    }
    t.cloexec = 0;
}
