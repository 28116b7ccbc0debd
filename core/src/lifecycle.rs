//! Task lifecycle: fork, exec, exit, and reaping.

use core::ptr;

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{PERM_EXEC, PROT_EXEC, PROT_READ, PROT_WRITE, s_isreg};
use cinder_abi::signal::{
    CLD_DUMPED, CLD_EXITED, CLD_KILLED, SIG_DFL, SIG_IGN, SigAltStack, W_CONTINUED, wifsignaled,
    wifstopped,
};
use cinder_abi::task::{
    PROPERTY_HANDLING_SIG, PROPERTY_IN_WAIT, PROPERTY_STATUS_REPORTED, PROPERTY_USER,
    PROPERTY_VFORK, TaskState, WCONTINUED, WNOHANG, WUNTRACED,
};
use cinder_abi::addr::PAGE_SIZE;
use cinder_fs::node::release_node;
use cinder_fs::path::{FsContext, has_perm, vfs_lookup};
use cinder_lib::klog_info;
use cinder_mm::mm_constants::USER_MEM_END;

use crate::memregion::{
    MEMREGION_FLAG_PRIVATE, MEMREGION_FLAG_USER, MEMREGION_TYPE_DATA, MEMREGION_TYPE_STACK,
    MEMREGION_TYPE_TEXT, memregion_alloc_and_attach, memregion_detach_user, task_mem_dup,
    task_mem_free,
};
use crate::regs::Regs;
use crate::sched::{cur_task, enqueue_ready, schedule, set_cur_task};
use crate::signal::add_task_child_signal;
use crate::task::{
    Task, fd_close_on_exec, task_alloc, task_files_alloc, task_files_dup, task_files_put,
    task_free_slot, task_fs_alloc, task_fs_dup, task_fs_put, task_iterate_active, task_sig_alloc,
    task_sig_dup, task_sig_put, task_vm_alloc,
};

/// Build the first task. It anchors the namespace at the system root and
/// adopts every later orphan.
pub fn task_create_init() -> KResult<*mut Task> {
    let task = task_alloc()?;
    let t = unsafe { &mut *task };
    t.properties = PROPERTY_USER;
    t.mem = task_vm_alloc();
    t.files = task_files_alloc();
    let root = cinder_fs::mount::system_root();
    t.fs = task_fs_alloc(root, root);
    t.sig = task_sig_alloc();
    t.name[..4].copy_from_slice(b"init");
    if t.mem.is_null() || t.files.is_null() || t.fs.is_null() || t.sig.is_null() {
        return Err(Errno::ENOMEM);
    }
    set_cur_task(task);
    klog_info!("task: init created (pid {})", t.pid);
    Ok(task)
}

/// The FsContext a task resolves paths with.
pub fn task_fs_context(task: *mut Task) -> FsContext {
    let t = unsafe { &*task };
    if t.fs.is_null() {
        return FsContext::kernel();
    }
    let f = unsafe { &*t.fs };
    FsContext {
        uid: t.euid,
        gid: t.egid,
        umask: f.umask,
        root: f.root,
        cwd: f.cwd,
    }
}

/// Fork the calling task. The child gets a COW copy of the address space,
/// counted references to the open files, its own fs anchors and signal
/// table, an empty pending set, and a register frame that returns 0.
pub fn do_fork(parent: *mut Task, regs: &Regs, vfork: bool) -> KResult<u32> {
    let child = task_alloc()?;
    let p = unsafe { &*parent };
    let c = unsafe { &mut *child };

    c.pgid = p.pgid;
    c.sid = p.sid;
    c.uid = p.uid;
    c.euid = p.euid;
    c.ssuid = p.ssuid;
    c.gid = p.gid;
    c.egid = p.egid;
    c.ssgid = p.ssgid;
    c.policy = p.policy;
    c.priority = p.priority;
    c.name = p.name;
    c.rlimits = p.rlimits;
    c.signal_mask = p.signal_mask;
    c.signal_stack = p.signal_stack;
    c.properties = PROPERTY_USER;
    if vfork {
        c.properties |= PROPERTY_VFORK;
    }
    c.parent = parent;

    c.mem = task_vm_alloc();
    c.files = task_files_dup(p.files);
    c.fs = task_fs_dup(p.fs);
    c.sig = task_sig_dup(p.sig);
    if c.mem.is_null() || c.files.is_null() || c.fs.is_null() || c.sig.is_null() {
        release_task_resources(child);
        task_free_slot(child);
        return Err(Errno::ENOMEM);
    }

    if let Err(e) = task_mem_dup(parent, child) {
        task_mem_free(child);
        release_task_resources(child);
        task_free_slot(child);
        return Err(e);
    }

    // The child resumes from the same frame with a zero return value.
    c.kernel_regs = *regs;
    c.kernel_regs.rax = 0;
    c.fpregs = p.fpregs;

    let pid = c.pid;
    enqueue_ready(child);
    klog_info!("task: forked pid {} from {}", pid, p.pid);
    Ok(pid)
}

fn release_task_resources(task: *mut Task) {
    let t = unsafe { &mut *task };
    task_files_put(t.files);
    t.files = ptr::null_mut();
    task_fs_put(t.fs);
    t.fs = ptr::null_mut();
    task_sig_put(t.sig);
    t.sig = ptr::null_mut();
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

const EXEC_TEXT_BASE: u64 = 0x40_0000;
const EXEC_STACK_PAGES: u64 = 16;
const EXEC_HEAP_GAP: u64 = 0x10_0000;

/// Replace the task's user image with the executable at `path`.
///
/// The task-layer contract is what lives here: every USER region is
/// detached, fresh TEXT/DATA/STACK regions are attached (the text demand-
/// pages straight from the file through the page cache), caught signal
/// handlers revert to their defaults, and close-on-exec descriptors go.
/// Decoding richer image formats on top of this is the loader's business.
pub fn do_execve(task: *mut Task, path: &[u8]) -> KResult<()> {
    let ctx = task_fs_context(task);
    let node = vfs_lookup(&ctx, path, ptr::null_mut(), true)?;

    {
        let n = unsafe { &*node };
        if !s_isreg(n.mode) {
            release_node(node);
            return Err(Errno::EACCES);
        }
        if !has_perm(&ctx, node, PERM_EXEC) {
            release_node(node);
            return Err(Errno::EACCES);
        }
    }

    let t = unsafe { &mut *task };
    let size = unsafe { (*node).size };
    let text_pages = size.div_ceil(PAGE_SIZE).max(1);

    memregion_detach_user(task, true);
    fd_close_on_exec(t.files);

    // Handlers that were catching signals revert to the default; ignored
    // and default dispositions survive the exec.
    if !t.sig.is_null() {
        let sig = unsafe { &mut *t.sig };
        for action in sig.actions.iter_mut() {
            if action.handler != SIG_DFL && action.handler != SIG_IGN {
                *action = crate::task::SigAction::default();
            }
        }
    }
    t.signal_stack = SigAltStack::disabled();
    t.properties &= !PROPERTY_HANDLING_SIG;
    t.interrupted_syscall = 0;

    let text_end = EXEC_TEXT_BASE + text_pages * PAGE_SIZE;
    memregion_alloc_and_attach(
        task,
        node,
        0,
        size,
        EXEC_TEXT_BASE,
        text_end,
        PROT_READ | PROT_EXEC,
        MEMREGION_TYPE_TEXT,
        MEMREGION_FLAG_PRIVATE | MEMREGION_FLAG_USER,
        false,
    )?;

    let data_start = text_end + EXEC_HEAP_GAP;
    let data_end = data_start + 4 * PAGE_SIZE;
    memregion_alloc_and_attach(
        task,
        ptr::null_mut(),
        0,
        0,
        data_start,
        data_end,
        PROT_READ | PROT_WRITE,
        MEMREGION_TYPE_DATA,
        MEMREGION_FLAG_PRIVATE | MEMREGION_FLAG_USER,
        false,
    )?;

    let stack_top = USER_MEM_END;
    let stack_start = stack_top - EXEC_STACK_PAGES * PAGE_SIZE;
    memregion_alloc_and_attach(
        task,
        ptr::null_mut(),
        0,
        0,
        stack_start,
        stack_top,
        PROT_READ | PROT_WRITE,
        MEMREGION_TYPE_STACK,
        MEMREGION_FLAG_PRIVATE | MEMREGION_FLAG_USER,
        false,
    )?;

    {
        let vm = unsafe { &mut *t.mem };
        vm.base_addr = EXEC_TEXT_BASE;
        vm.end_data = data_end;
        vm.end_stack = stack_top;
    }

    t.kernel_regs = Regs::zero();
    t.kernel_regs.rip = EXEC_TEXT_BASE;
    t.kernel_regs.userrsp = stack_top - 16;

    // The region layer holds its own reference now.
    release_node(node);
    klog_info!("task: pid {} exec'd ({} text pages)", t.pid, text_pages);
    Ok(())
}

// ---------------------------------------------------------------------------
// exit and reaping
// ---------------------------------------------------------------------------

/// Turn `task` into a zombie with `status`, releasing everything except
/// the memory map (reaped with the slot) and notifying the parent.
pub fn terminate_task(task: *mut Task, status: i32, dumped: bool) {
    let t = unsafe { &mut *task };
    if t.state() == TaskState::Zombie {
        return;
    }

    t.exit_status = status;

    // The user image goes now; a vforked child leaves shared memory to
    // its parent.
    memregion_detach_user(task, true);

    release_task_resources(task);

    // Orphans go to init.
    let init = crate::task::init_task();
    task_iterate_active(|other| {
        if other != task && unsafe { (*other).parent } == task {
            unsafe { (*other).parent = init };
        }
    });

    t.set_state(TaskState::Zombie);

    let code = if dumped {
        CLD_DUMPED
    } else if wifsignaled(status) {
        CLD_KILLED
    } else {
        CLD_EXITED
    };
    add_task_child_signal(task, code, status);

    klog_info!("task: pid {} exited with status {:#x}", t.pid, status);

    if task == cur_task() {
        schedule();
    }
}

/// exit(2): normal termination with an exit code.
pub fn do_exit(task: *mut Task, code: i32) {
    terminate_task(task, cinder_abi::signal::w_exitcode(code, 0), false);
}

fn child_matches(parent: *mut Task, child: &Task, pid: i64) -> bool {
    if child.parent != parent {
        return false;
    }
    if pid > 0 {
        child.pid as i64 == pid
    } else if pid == -1 {
        true
    } else if pid == 0 {
        child.pgid == unsafe { (*parent).pgid }
    } else {
        child.pgid as i64 == -pid
    }
}

/// wait4/waitpid: reap zombies, report stop/continue transitions, block
/// until a child changes state.
pub fn do_waitpid(
    parent: *mut Task,
    pid: i64,
    status_out: &mut i32,
    options: u32,
) -> KResult<u32> {
    loop {
        let mut have_children = false;
        let mut reaped: *mut Task = ptr::null_mut();
        let mut reported: *mut Task = ptr::null_mut();
        let mut report_status = 0;

        task_iterate_active(|child| {
            if !reaped.is_null() || !reported.is_null() {
                return;
            }
            let c = unsafe { &mut *child };
            if !child_matches(parent, c, pid) {
                return;
            }
            have_children = true;

            match c.state() {
                TaskState::Zombie => reaped = child,
                TaskState::Stopped => {
                    if options & WUNTRACED != 0
                        && wifstopped(c.exit_status)
                        && !c.has_property(PROPERTY_STATUS_REPORTED)
                    {
                        c.properties |= PROPERTY_STATUS_REPORTED;
                        report_status = c.exit_status;
                        reported = child;
                    }
                }
                _ => {
                    if options & WCONTINUED != 0
                        && c.exit_status == W_CONTINUED
                        && !c.has_property(PROPERTY_STATUS_REPORTED)
                    {
                        c.properties |= PROPERTY_STATUS_REPORTED;
                        report_status = c.exit_status;
                        reported = child;
                    }
                }
            }
        });

        if !reaped.is_null() {
            let c = unsafe { &mut *reaped };
            let child_pid = c.pid;
            *status_out = c.exit_status;
            let p = unsafe { &mut *parent };
            p.child_user_time += c.user_time + c.child_user_time;
            p.child_sys_time += c.sys_time + c.child_sys_time;
            task_mem_free(reaped);
            task_free_slot(reaped);
            return Ok(child_pid);
        }
        if !reported.is_null() {
            *status_out = report_status;
            return Ok(unsafe { (*reported).pid });
        }

        if !have_children {
            return Err(Errno::ECHILD);
        }
        if options & WNOHANG != 0 {
            *status_out = 0;
            return Ok(0);
        }

        let p = unsafe { &mut *parent };
        p.properties |= PROPERTY_IN_WAIT;
        let res = crate::sched::block_task(parent as usize, true);
        p.properties &= !PROPERTY_IN_WAIT;
        if res == Errno::EINTR.as_neg() as i32 {
            return Err(Errno::ERESTARTSYS);
        }
    }
}
