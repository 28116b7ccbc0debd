//! Signal-management syscalls (delivery itself lives in `signal`).

use core::sync::atomic::Ordering;

use cinder_abi::errno::Errno;
use cinder_abi::signal::{
    NSIG, SIG_BLOCK, SIG_DFL, SIG_IGN, SIG_SETMASK, SIG_UNBLOCK, SIG_UNCATCHABLE, SigAltStack,
    SigSet, UserSigaction, sig_bit,
};
use cinder_lib::clock::ticks;

use crate::regs::Regs;
use crate::sched::block_task2;
use crate::syscall::ok_or_neg;
use crate::task::{SigAction, Task};
use crate::user_copy::{copy_from_user, copy_to_user};

pub fn sys_sigaction(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let raw_sig = regs.arg(0);
        let unew = regs.arg(1);
        let uold = regs.arg(2);

        if raw_sig == 0 || raw_sig as usize >= NSIG {
            return Err(Errno::EINVAL);
        }
        let signum = raw_sig as u8;
        let idx = (signum - 1) as usize;
        let t = unsafe { &mut *task };
        if t.sig.is_null() {
            return Err(Errno::EINVAL);
        }
        let sig = unsafe { &mut *t.sig };

        if uold != 0 {
            let action = &sig.actions[idx];
            let old = UserSigaction {
                sa_handler: action.handler,
                sa_flags: action.flags,
                sa_restorer: action.restorer,
                sa_mask: action.mask,
            };
            copy_to_user(task, uold, &old)?;
        }

        if unew != 0 {
            if sig_bit(signum) & SIG_UNCATCHABLE != 0 {
                return Err(Errno::EINVAL);
            }
            let new: UserSigaction = copy_from_user(task, unew)?;
            if new.sa_handler != SIG_DFL && new.sa_handler != SIG_IGN && new.sa_restorer == 0 {
                // Handlers return through the restorer trampoline; without
                // one the delivery path has nowhere to come back to.
                return Err(Errno::EINVAL);
            }
            sig.actions[idx] = SigAction {
                handler: new.sa_handler,
                flags: new.sa_flags,
                restorer: new.sa_restorer,
                mask: new.sa_mask & !SIG_UNCATCHABLE,
            };
        }
        Ok(0)
    })())
}

pub fn sys_sigprocmask(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let how = regs.arg(0) as u32;
        let unew = regs.arg(1);
        let uold = regs.arg(2);
        let t = unsafe { &mut *task };

        if uold != 0 {
            copy_to_user(task, uold, &t.signal_mask)?;
        }

        if unew != 0 {
            let set: SigSet = copy_from_user(task, unew)?;
            let mut mask = t.signal_mask;
            match how {
                SIG_BLOCK => mask |= set,
                SIG_UNBLOCK => mask &= !set,
                SIG_SETMASK => mask = set,
                _ => return Err(Errno::EINVAL),
            }
            t.signal_mask = mask & !SIG_UNCATCHABLE;
        }
        Ok(0)
    })())
}

pub fn sys_sigpending(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let t = unsafe { &*task };
        let pending = t.signal_pending.load(Ordering::Acquire) & t.signal_mask;
        copy_to_user(task, regs.arg(0), &pending)?;
        Ok(0)
    })())
}

/// Swap the mask in, sleep until a signal arrives, swap it back. Always
/// "fails" with EINTR once the handler has run.
pub fn sys_sigsuspend(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let set: SigSet = copy_from_user(task, regs.arg(0))?;
        let t = unsafe { &mut *task };

        let old_mask = t.signal_mask;
        t.signal_mask = set & !SIG_UNCATCHABLE;

        loop {
            let res = crate::sched::block_task(task as usize, true);
            if res == Errno::EINTR.as_neg() as i32 {
                break;
            }
        }

        // The delivery path saves/restores around the handler; the mask
        // the caller gave us ends with the call.
        t.signal_mask = old_mask;
        Err(Errno::EINTR)
    })())
}

pub fn sys_sigtimedwait(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let set: SigSet = copy_from_user(task, regs.arg(0))?;
        let uinfo = regs.arg(1);
        let timeout_ticks = regs.arg(2);

        let t = unsafe { &mut *task };
        let deadline = if timeout_ticks > 0 {
            ticks() + timeout_ticks
        } else {
            0
        };

        loop {
            let pending = t.signal_pending.load(Ordering::Acquire);
            let hit = pending & set;
            if hit != 0 {
                let signum = (hit.trailing_zeros() + 1) as u8;
                t.signal_pending
                    .fetch_and(!sig_bit(signum), Ordering::AcqRel);
                if uinfo != 0 {
                    let info = t.siginfo[signum as usize];
                    copy_to_user(task, uinfo, &info)?;
                }
                return Ok(signum as i64);
            }

            if deadline != 0 && ticks() >= deadline {
                return Err(Errno::EAGAIN);
            }

            let res = block_task2(task as usize, 2);
            if res == Errno::EINTR.as_neg() as i32 {
                // A signal outside the set arrived; let delivery handle it.
                let outside = t.signal_pending.load(Ordering::Acquire) & !set;
                if outside != 0 {
                    return Err(Errno::EINTR);
                }
            }
        }
    })())
}

pub fn sys_sigaltstack(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let unew = regs.arg(0);
        let uold = regs.arg(1);

        let new = if unew != 0 {
            Some(copy_from_user::<SigAltStack>(task, unew)?)
        } else {
            None
        };

        let mut old = SigAltStack::disabled();
        crate::signal::do_sigaltstack(
            task,
            new.as_ref(),
            if uold != 0 { Some(&mut old) } else { None },
        )?;
        if uold != 0 {
            copy_to_user(task, uold, &old)?;
        }
        Ok(0)
    })())
}
