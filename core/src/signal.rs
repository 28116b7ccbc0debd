//! Signal posting, delivery, and the user-stack trampoline.
//!
//! Delivery happens on the way back to user mode: the lowest-numbered
//! deliverable signal is cleared from the pending set and dispatched.
//! Catchers get a frame pushed onto the user stack (or the sigaltstack)
//! carrying the FPU area, the saved `interrupted_syscall`, the full saved
//! register set, a siginfo, and {restorer, signum, &info, &ucontext}; the
//! interrupted context is then deliberately redirected into the handler.
//! The handler's epilogue is the user-mode restorer, whose sigreturn
//! syscall undoes the redirection — restoring mask, registers (with
//! selectors and the interrupt flag sanitized), FPU state, and rearming a
//! transparent syscall restart when the action asked for one.

use core::sync::atomic::Ordering;

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::signal::{
    CLD_CONTINUED, CLD_STOPPED, MINSIGSTKSZ, NSIG, SA_NOCLDSTOP, SA_NODEFER, SA_ONSTACK,
    SA_RESETHAND, SA_RESTART, SA_RESTORER, SIG_DFL, SIG_IGN, SIG_UNCATCHABLE, SIGCHLD, SIGCONT,
    SIGILL, SIGKILL, SIGSTOP, SIGTRAP, SIGTSTP, SIGTTIN, SIGTTOU, SS_DISABLE, SS_ONSTACK,
    SigAltStack, SigDefault, SigInfo, W_CONTINUED, sig_bit, sig_default_action, w_coredump,
    w_exitcode, w_stopcode,
};
use cinder_abi::task::{PROPERTY_HANDLING_SIG, PROPERTY_USER, TaskState};
use cinder_lib::klog_debug;

use crate::lifecycle::terminate_task;
use crate::regs::{RFLAGS_IF, Regs, USER_CS, USER_SS};
use crate::sched::{cur_task, schedule, signal_would_wake, wake_for_signal};
use crate::task::Task;
use crate::user_copy::{copy_from_user, copy_to_user, copy_to_user_bytes};

/// The saved general-purpose register set carried in the signal frame.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct SignalUContext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// The four words at the top of the delivered stack: the restorer is the
/// handler's return address.
#[repr(C)]
#[derive(Copy, Clone)]
struct SigFrame {
    restorer: u64,
    signum: u64,
    info_ptr: u64,
    ucontext_ptr: u64,
}

const FPU_AREA: usize = 512;

// ---------------------------------------------------------------------------
// Posting
// ---------------------------------------------------------------------------

/// Post `signum` against `task`. Permission follows the classic uid rule
/// unless `force` (kernel-origin signals). Posting is idempotent while
/// pending; stop and continue signals cancel each other; an interruptible
/// sleeper whose mask and action admit the signal is woken.
pub fn add_task_signal(
    task: *mut Task,
    signum: u8,
    info: Option<&SigInfo>,
    force: bool,
) -> KResult<()> {
    if task.is_null() {
        return Err(Errno::ESRCH);
    }
    if signum as usize >= NSIG {
        return Err(Errno::EINVAL);
    }
    // The null signal is permission-probing only.
    if signum == 0 {
        return Ok(());
    }

    let t = unsafe { &mut *task };

    // Kernel service tasks never take signals.
    if !t.has_property(PROPERTY_USER) {
        return Err(Errno::EPERM);
    }

    if !force {
        let ct = cur_task();
        if !ct.is_null() {
            let c = unsafe { &*ct };
            if c.uid != t.uid && c.uid != t.ssuid && c.euid != t.uid && c.euid != t.ssuid {
                return Err(Errno::EPERM);
            }
        }
    }

    let bit = sig_bit(signum);
    let already = t.signal_pending.load(Ordering::Acquire) & bit != 0;

    if !already {
        // Stop and continue annihilate each other in the pending set.
        if matches!(signum, SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU) {
            t.signal_pending
                .fetch_and(!sig_bit(SIGCONT), Ordering::AcqRel);
        } else if signum == SIGCONT {
            let stops = sig_bit(SIGSTOP) | sig_bit(SIGTSTP) | sig_bit(SIGTTIN) | sig_bit(SIGTTOU);
            t.signal_pending.fetch_and(!stops, Ordering::AcqRel);
        }

        t.signal_pending.fetch_or(bit, Ordering::AcqRel);
        match info {
            Some(i) => {
                t.siginfo[signum as usize] = *i;
            }
            None => {
                t.siginfo[signum as usize] = SigInfo::zero();
            }
        }
        t.siginfo[signum as usize].si_signo = signum as i32;
    }

    // A continued task wakes regardless of masks, and its parent hears
    // about it.
    if signum == SIGCONT && t.state() == TaskState::Stopped {
        t.exit_status = W_CONTINUED;
        add_task_child_signal(task, CLD_CONTINUED, signum as i32);
        crate::sched::unblock_task(task);
        return Ok(());
    }

    if t.state() == TaskState::Sleeping
        && (signum == SIGKILL || signal_would_wake(t, signum))
    {
        klog_debug!("signal: waking task {} for signal {}", t.pid, signum);
        wake_for_signal(task, signum);
    }

    Ok(())
}

/// Post from the current user task, with its credentials in the siginfo.
pub fn user_add_task_signal(task: *mut Task, signum: u8, force: bool) -> KResult<()> {
    let ct = cur_task();
    let mut info = SigInfo::zero();
    info.si_code = cinder_abi::signal::SI_USER;
    if !ct.is_null() {
        info.si_pid = unsafe { (*ct).pid };
        info.si_uid = unsafe { (*ct).uid };
    }
    add_task_signal(task, signum, Some(&info), force)
}

/// Send SIGCHLD to `task`'s parent for a status change. A parent blocked
/// in wait*() is woken instead of signalled; SA_NOCLDSTOP suppresses the
/// stop/continue notifications.
pub fn add_task_child_signal(task: *mut Task, code: i32, status: i32) {
    let t = unsafe { &*task };
    let parent = t.parent;
    if parent.is_null() {
        return;
    }
    let p = unsafe { &*parent };

    if p.has_property(cinder_abi::task::PROPERTY_IN_WAIT) {
        crate::sched::unblock_task(parent);
        return;
    }

    if !p.sig.is_null() {
        let act = unsafe { &(*p.sig).actions[(SIGCHLD - 1) as usize] };
        if act.handler == SIG_IGN {
            return;
        }
        if act.flags & SA_NOCLDSTOP != 0 && matches!(code, CLD_STOPPED | CLD_CONTINUED) {
            return;
        }
    }

    let mut info = SigInfo::zero();
    info.si_code = code;
    info.si_pid = t.pid;
    info.si_uid = t.uid;
    info.si_status = status;
    let _ = add_task_signal(parent, SIGCHLD, Some(&info), true);
}

/// Post a memory-fault signal with the faulting address.
pub fn add_task_segv_signal(task: *mut Task, signum: u8, code: i32, addr: u64) {
    let mut info = SigInfo::zero();
    info.si_code = code;
    info.si_addr = addr;
    let _ = add_task_signal(task, signum, Some(&info), true);
}

/// Post a timer signal, recording the overrun count for delivery.
pub fn add_task_timer_signal(task: *mut Task, signum: u8, overruns: i32) -> KResult<()> {
    let mut info = SigInfo::zero();
    info.si_code = cinder_abi::signal::SI_TIMER;
    info.si_overruns = overruns;
    unsafe { (*task).signal_timer |= sig_bit(signum) };
    add_task_signal(task, signum, Some(&info), true)
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Re-enter the dispatcher for a syscall whose interruptible sleep was
/// broken by a handled signal with SA_RESTART.
pub fn restart_syscall(task: *mut Task, regs: &mut Regs) {
    let t = unsafe { &mut *task };
    if t.interrupted_syscall != 0 && regs.result() == Errno::ERESTARTSYS.as_neg() {
        let nr = t.interrupted_syscall;
        t.interrupted_syscall = 0;
        regs.rax = nr;
        crate::syscall::syscall_dispatcher(task, regs);
    } else {
        t.interrupted_syscall = 0;
    }
}

fn stop_current(task: *mut Task) {
    let t = unsafe { &*task };
    t.set_state(TaskState::Stopped);
    while t.state() == TaskState::Stopped {
        schedule();
        cinder_lib::cpu::relax();
    }
    t.set_state(TaskState::Running);
}

/// Dispatch one signal. Returns true when delivery redirected the user
/// context (or terminated the task) and signal processing must stop.
fn handle_signal(task: *mut Task, regs: &mut Regs, signum: u8) -> bool {
    let t = unsafe { &mut *task };

    if t.state() == TaskState::Zombie {
        return true;
    }

    t.properties |= PROPERTY_HANDLING_SIG;
    t.regs = regs;

    let action = unsafe { (*t.sig).actions[(signum - 1) as usize] };

    // A broken interruptible sleep only restarts transparently when the
    // handler asks for it; otherwise user space sees EINTR.
    if action.handler != SIG_DFL
        && action.flags & SA_RESTART == 0
        && regs.result() == Errno::ERESTARTSYS.as_neg()
    {
        regs.set_result(Errno::EINTR.as_neg());
    }

    if action.handler == SIG_IGN {
        t.properties &= !PROPERTY_HANDLING_SIG;
        restart_syscall(task, regs);
        return false;
    }

    t.signal_caught |= sig_bit(signum);

    if action.handler == SIG_DFL {
        match sig_default_action(signum) {
            SigDefault::Ignore | SigDefault::Continue => {
                t.properties &= !PROPERTY_HANDLING_SIG;
                restart_syscall(task, regs);
                return false;
            }
            SigDefault::Stop => {
                t.exit_status = w_stopcode(signum as i32);
                add_task_child_signal(task, CLD_STOPPED, signum as i32);
                stop_current(task);
                t.properties &= !PROPERTY_HANDLING_SIG;
                return false;
            }
            SigDefault::Terminate => {
                terminate_task(task, w_exitcode(0, signum as i32), false);
                return true;
            }
            SigDefault::CoreDump => {
                terminate_task(task, w_coredump(w_exitcode(0, signum as i32)), true);
                return true;
            }
        }
    }

    // User handler: it must have supplied a restorer for its epilogue.
    if action.flags & SA_RESTORER == 0 || action.restorer == 0 {
        terminate_task(task, w_exitcode(0, signum as i32), false);
        return true;
    }

    // Choose the stack: the sigaltstack when asked for and armed.
    let on_altstack = action.flags & SA_ONSTACK != 0
        && t.signal_stack.ss_sp != 0
        && t.signal_stack.ss_flags & SS_DISABLE == 0;
    let mut stack = if on_altstack {
        t.signal_stack.ss_sp + t.signal_stack.ss_size
    } else {
        regs.userrsp
    };
    stack &= !0xF;

    // Frame layout, top of stack downward: FPU area, the saved
    // interrupted_syscall, the ucontext, the siginfo, then the call frame.
    let fpu_addr = stack - FPU_AREA as u64;
    let intsys_addr = fpu_addr - 8;
    let ucontext_addr = intsys_addr - core::mem::size_of::<SignalUContext>() as u64;
    let info_addr = ucontext_addr - core::mem::size_of::<SigInfo>() as u64;
    let frame_addr = info_addr - core::mem::size_of::<SigFrame>() as u64;

    let ucontext = SignalUContext {
        r8: regs.r8,
        r9: regs.r9,
        r10: regs.r10,
        r11: regs.r11,
        r12: regs.r12,
        r13: regs.r13,
        r14: regs.r14,
        r15: regs.r15,
        rsp: regs.userrsp,
        rbp: regs.rbp,
        rdi: regs.rdi,
        rsi: regs.rsi,
        rdx: regs.rdx,
        rcx: regs.rcx,
        rbx: regs.rbx,
        rax: regs.rax,
        rip: regs.rip,
        rflags: regs.rflags,
    };
    let frame = SigFrame {
        restorer: action.restorer,
        signum: signum as u64,
        info_ptr: info_addr,
        ucontext_ptr: ucontext_addr,
    };

    // Timer-armed signals carry their overrun count in the siginfo slot.
    if t.signal_timer & sig_bit(signum) != 0 {
        t.signal_timer &= !sig_bit(signum);
    }
    let info = t.siginfo[signum as usize];

    let fpregs = t.fpregs;
    let interrupted = t.interrupted_syscall;
    let pushed = copy_to_user_bytes(task, fpu_addr, &fpregs)
        .and_then(|_| copy_to_user(task, intsys_addr, &interrupted))
        .and_then(|_| copy_to_user(task, ucontext_addr, &ucontext))
        .and_then(|_| copy_to_user(task, info_addr, &info))
        .and_then(|_| copy_to_user(task, frame_addr, &frame));
    if pushed.is_err() {
        // The stack is gone; the queued SIGSEGV takes over from here.
        let t = unsafe { &mut *task };
        t.properties &= !PROPERTY_HANDLING_SIG;
        return false;
    }
    let t = unsafe { &mut *task };

    // Mask update: the action's mask, plus the signal itself unless the
    // handler tolerates re-entry.
    t.saved_sigmask = t.signal_mask;
    t.signal_mask |= action.mask;
    if action.flags & SA_NODEFER != 0 {
        t.signal_mask &= !sig_bit(signum);
    } else {
        t.signal_mask |= sig_bit(signum);
    }
    t.signal_mask &= !SIG_UNCATCHABLE;

    if action.flags & SA_RESETHAND != 0 && signum != SIGILL && signum != SIGTRAP {
        unsafe {
            (*t.sig).actions[(signum - 1) as usize].handler = SIG_DFL;
        }
    }

    if on_altstack {
        t.signal_stack.ss_flags |= SS_ONSTACK;
    }

    // Redirect the interrupted context into the handler. The restorer at
    // the top of the frame is its return address.
    regs.userrsp = frame_addr;
    regs.rip = action.handler;
    regs.rdi = signum as u64;
    regs.rsi = info_addr;
    regs.rdx = ucontext_addr;
    true
}

/// Deliver pending signals on return to user mode. Skipped while a
/// handler frame is already live.
pub fn check_pending_signals(regs: &mut Regs) {
    let task = cur_task();
    if task.is_null() {
        return;
    }
    let t = unsafe { &mut *task };
    if t.has_property(PROPERTY_HANDLING_SIG) || t.sig.is_null() {
        return;
    }

    loop {
        let pending = t.signal_pending.load(Ordering::Acquire);
        if pending == 0 {
            break;
        }
        let deliverable = pending & (!t.signal_mask | SIG_UNCATCHABLE);
        if deliverable == 0 {
            break;
        }
        let signum = (deliverable.trailing_zeros() + 1) as u8;
        t.signal_pending
            .fetch_and(!sig_bit(signum), Ordering::AcqRel);
        t.woke_by_signal = 0;

        if handle_signal(task, regs, signum) {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// sigreturn
// ---------------------------------------------------------------------------

/// Undo a signal delivery. `regs.userrsp` points just past the consumed
/// restorer word. The handler may have edited the frame, so the restored
/// selectors and interrupt flag are forced sane rather than trusted.
pub fn syscall_sigreturn(task: *mut Task, regs: &mut Regs) -> i64 {
    let t = unsafe { &mut *task };
    let rsp = regs.userrsp;

    t.signal_mask = t.saved_sigmask & !SIG_UNCATCHABLE;

    // Walk the frame by layout: three words (signum, &info, &ucontext),
    // the siginfo, then the ucontext.
    let info_addr = rsp + 3 * 8;
    let ucontext_addr = info_addr + core::mem::size_of::<SigInfo>() as u64;
    let intsys_addr = ucontext_addr + core::mem::size_of::<SignalUContext>() as u64;
    let fpu_addr = intsys_addr + 8;

    let Ok(ucontext) = copy_from_user::<SignalUContext>(task, ucontext_addr) else {
        return Errno::EFAULT.as_neg();
    };

    regs.r8 = ucontext.r8;
    regs.r9 = ucontext.r9;
    regs.r10 = ucontext.r10;
    regs.r11 = ucontext.r11;
    regs.r12 = ucontext.r12;
    regs.r13 = ucontext.r13;
    regs.r14 = ucontext.r14;
    regs.r15 = ucontext.r15;
    regs.userrsp = ucontext.rsp;
    regs.rbp = ucontext.rbp;
    regs.rdi = ucontext.rdi;
    regs.rsi = ucontext.rsi;
    regs.rdx = ucontext.rdx;
    regs.rcx = ucontext.rcx;
    regs.rbx = ucontext.rbx;
    regs.rax = ucontext.rax;
    regs.rip = ucontext.rip;
    regs.rflags = ucontext.rflags | RFLAGS_IF;

    // The handler can scribble anything into the saved frame; selectors
    // are forced back to user mode.
    regs.cs = USER_CS;
    regs.ss = USER_SS;

    if let Ok(interrupted) = copy_from_user::<u64>(task, intsys_addr) {
        t.interrupted_syscall = interrupted;
    }
    let mut fpu = [0u8; FPU_AREA];
    if crate::user_copy::copy_from_user_bytes(task, fpu_addr, &mut fpu).is_ok() {
        t.fpregs = fpu;
    }

    t.properties &= !PROPERTY_HANDLING_SIG;
    t.signal_stack.ss_flags &= !SS_ONSTACK;

    restart_syscall(task, regs);
    regs.result()
}

// ---------------------------------------------------------------------------
// sigaltstack
// ---------------------------------------------------------------------------

/// Install or query the alternate signal stack. Reconfiguration is
/// refused while a handler is executing on it.
pub fn do_sigaltstack(task: *mut Task, new: Option<&SigAltStack>, old: Option<&mut SigAltStack>) -> KResult<()> {
    let t = unsafe { &mut *task };

    if let Some(old) = old {
        *old = t.signal_stack;
    }

    if let Some(new) = new {
        if new.ss_flags != 0 && new.ss_flags != SS_ONSTACK && new.ss_flags != SS_DISABLE {
            return Err(Errno::EINVAL);
        }
        if t.signal_stack.ss_flags & SS_ONSTACK != 0 {
            return Err(Errno::EPERM);
        }
        if new.ss_flags != SS_DISABLE {
            if new.ss_size < MINSIGSTKSZ {
                return Err(Errno::ENOMEM);
            }
            if new.ss_sp >= cinder_mm::mm_constants::USER_MEM_END
                || new.ss_sp + new.ss_size > cinder_mm::mm_constants::USER_MEM_END
            {
                return Err(Errno::EINVAL);
            }
            if crate::memregion::memregion_containing(task, new.ss_sp).is_null() {
                return Err(Errno::EFAULT);
            }
        }
        t.signal_stack = *new;
        if new.ss_flags == SS_DISABLE {
            t.signal_stack.ss_sp = 0;
            t.signal_stack.ss_size = 0;
        } else {
            t.signal_stack.ss_flags = 0;
        }
    }
    Ok(())
}
