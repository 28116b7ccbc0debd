//! Process-management syscalls.

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::signal::NSIG;
use cinder_abi::task::{
    INVALID_TASK_ID, RLIM_NLIMITS, RLimit, SCHED_FIFO, SCHED_OTHER, SCHED_RR, TaskState,
};
use cinder_lib::clock::ticks;

use crate::lifecycle::{do_execve, do_exit, do_fork, do_waitpid};
use crate::regs::Regs;
use crate::sched::{cur_task, schedule};
use crate::signal::user_add_task_signal;
use crate::syscall::{ok_or_neg, path_from_user};
use crate::task::{Task, task_find_by_id, task_iterate_active};
use crate::user_copy::{copy_from_user, copy_to_user};

pub fn sys_fork(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(do_fork(task, regs, false).map(|pid| pid as i64))
}

pub fn sys_vfork(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(do_fork(task, regs, true).map(|pid| pid as i64))
}

pub fn sys_execve(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let path = path_from_user(task, regs.arg(0))?;
        do_execve(task, path.bytes())?;
        // The caller resumes in the new image.
        *regs = unsafe { (*task).kernel_regs };
        Ok(0)
    })())
}

pub fn sys_exit(task: *mut Task, regs: &mut Regs) -> i64 {
    do_exit(task, regs.arg(0) as i32);
    0
}

pub fn sys_wait4(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let pid = regs.arg(0) as i64;
        let ustatus = regs.arg(1);
        let options = regs.arg(2) as u32;

        let mut status = 0i32;
        let child = do_waitpid(task, pid, &mut status, options)?;
        if ustatus != 0 {
            copy_to_user(task, ustatus, &status)?;
        }
        Ok(child as i64)
    })())
}

// ---------------------------------------------------------------------------
// kill
// ---------------------------------------------------------------------------

fn kill_one(target: *mut Task, signum: u8) -> KResult<()> {
    user_add_task_signal(target, signum, false)
}

pub fn sys_kill(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let pid = regs.arg(0) as i64;
        let raw_sig = regs.arg(1);
        if raw_sig as usize >= NSIG {
            return Err(Errno::EINVAL);
        }
        let signum = raw_sig as u8;
        let me = unsafe { &*task };

        let mut hit = 0usize;
        let mut last_err = Errno::ESRCH;

        if pid > 0 {
            let target = task_find_by_id(pid as u32);
            if target.is_null() {
                return Err(Errno::ESRCH);
            }
            kill_one(target, signum)?;
            hit = 1;
        } else {
            // 0: the caller's process group; -1: everyone else;
            // < -1: the given process group.
            let pgid = if pid == 0 {
                me.pgid
            } else if pid < -1 {
                (-pid) as u32
            } else {
                INVALID_TASK_ID
            };

            task_iterate_active(|t| {
                let other = unsafe { &*t };
                if other.state() == TaskState::Zombie {
                    return;
                }
                let matches = if pid == -1 {
                    t != task
                } else {
                    other.pgid == pgid
                };
                if matches {
                    match kill_one(t, signum) {
                        Ok(()) => hit += 1,
                        Err(e) => last_err = e,
                    }
                }
            });
        }

        if hit == 0 { Err(last_err) } else { Ok(0) }
    })())
}

// ---------------------------------------------------------------------------
// Identity and scheduling
// ---------------------------------------------------------------------------

pub fn sys_getpid(task: *mut Task, _regs: &mut Regs) -> i64 {
    unsafe { (*task).pid as i64 }
}

pub fn sys_getppid(task: *mut Task, _regs: &mut Regs) -> i64 {
    let parent = unsafe { (*task).parent };
    if parent.is_null() {
        0
    } else {
        unsafe { (*parent).pid as i64 }
    }
}

pub fn sys_sched_yield(_task: *mut Task, _regs: &mut Regs) -> i64 {
    schedule();
    0
}

pub fn sys_sched_getscheduler(task: *mut Task, regs: &mut Regs) -> i64 {
    let pid = regs.arg(0) as u32;
    let target = if pid == 0 {
        task
    } else {
        task_find_by_id(pid)
    };
    if target.is_null() {
        return Errno::ESRCH.as_neg();
    }
    unsafe { (*target).policy as i64 }
}

pub fn sys_sched_setscheduler(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let pid = regs.arg(0) as u32;
        let policy = regs.arg(1) as u32;
        if !matches!(policy, SCHED_OTHER | SCHED_FIFO | SCHED_RR) {
            return Err(Errno::EINVAL);
        }
        let me = unsafe { &*task };
        if policy != SCHED_OTHER && me.euid != 0 {
            return Err(Errno::EPERM);
        }
        let target = if pid == 0 { task } else { task_find_by_id(pid) };
        if target.is_null() {
            return Err(Errno::ESRCH);
        }
        unsafe { (*target).policy = policy };
        Ok(0)
    })())
}

// ---------------------------------------------------------------------------
// Resource limits and accounting
// ---------------------------------------------------------------------------

pub fn sys_getrlimit(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let which = regs.arg(0) as usize;
        if which >= RLIM_NLIMITS {
            return Err(Errno::EINVAL);
        }
        let lim = unsafe { (*task).rlimits[which] };
        copy_to_user(task, regs.arg(1), &lim)?;
        Ok(0)
    })())
}

pub fn sys_setrlimit(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let which = regs.arg(0) as usize;
        if which >= RLIM_NLIMITS {
            return Err(Errno::EINVAL);
        }
        let new: RLimit = copy_from_user(task, regs.arg(1))?;
        let t = unsafe { &mut *task };
        if new.rlim_cur > new.rlim_max {
            return Err(Errno::EINVAL);
        }
        if new.rlim_max > t.rlimits[which].rlim_max && t.euid != 0 {
            return Err(Errno::EPERM);
        }
        t.rlimits[which] = new;
        Ok(0)
    })())
}

pub fn sys_prlimit(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let pid = regs.arg(0) as u32;
        let which = regs.arg(1) as usize;
        let unew = regs.arg(2);
        let uold = regs.arg(3);
        if which >= RLIM_NLIMITS {
            return Err(Errno::EINVAL);
        }
        let target = if pid == 0 { task } else { task_find_by_id(pid) };
        if target.is_null() {
            return Err(Errno::ESRCH);
        }
        if uold != 0 {
            let lim = unsafe { (*target).rlimits[which] };
            copy_to_user(task, uold, &lim)?;
        }
        if unew != 0 {
            let new: RLimit = copy_from_user(task, unew)?;
            if new.rlim_cur > new.rlim_max {
                return Err(Errno::EINVAL);
            }
            unsafe { (*target).rlimits[which] = new };
        }
        Ok(0)
    })())
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct UserRusage {
    ru_utime_ticks: u64,
    ru_stime_ticks: u64,
}

pub fn sys_getrusage(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let who = regs.arg(0) as i32;
        let t = unsafe { &*task };
        let usage = match who {
            // RUSAGE_SELF
            0 => UserRusage {
                ru_utime_ticks: t.user_time,
                ru_stime_ticks: t.sys_time,
            },
            // RUSAGE_CHILDREN
            -1 => UserRusage {
                ru_utime_ticks: t.child_user_time,
                ru_stime_ticks: t.child_sys_time,
            },
            _ => return Err(Errno::EINVAL),
        };
        copy_to_user(task, regs.arg(1), &usage)?;
        Ok(0)
    })())
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct UserTms {
    tms_utime: u64,
    tms_stime: u64,
    tms_cutime: u64,
    tms_cstime: u64,
}

pub fn sys_times(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let t = unsafe { &*task };
        let tms = UserTms {
            tms_utime: t.user_time,
            tms_stime: t.sys_time,
            tms_cutime: t.child_user_time,
            tms_cstime: t.child_sys_time,
        };
        if regs.arg(0) != 0 {
            copy_to_user(task, regs.arg(0), &tms)?;
        }
        Ok(ticks() as i64)
    })())
}

#[repr(C)]
#[derive(Copy, Clone)]
struct UserUtsname {
    sysname: [u8; 65],
    nodename: [u8; 65],
    release: [u8; 65],
    version: [u8; 65],
    machine: [u8; 65],
}

pub fn sys_uname(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let mut uts = UserUtsname {
            sysname: [0; 65],
            nodename: [0; 65],
            release: [0; 65],
            version: [0; 65],
            machine: [0; 65],
        };
        uts.sysname[..8].copy_from_slice(b"CinderOS");
        uts.nodename[..6].copy_from_slice(b"cinder");
        uts.release[..5].copy_from_slice(b"0.1.0");
        uts.version[..5].copy_from_slice(b"0.1.0");
        uts.machine[..6].copy_from_slice(b"x86_64");
        copy_to_user(task, regs.arg(0), &uts)?;
        Ok(0)
    })())
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct UserSysinfo {
    uptime_ticks: u64,
    total_ram: u64,
    free_ram: u64,
    procs: u64,
}

pub fn sys_sysinfo(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let mut procs = 0u64;
        task_iterate_active(|_| procs += 1);
        let info = UserSysinfo {
            uptime_ticks: ticks(),
            total_ram: cinder_mm::mm_constants::FRAME_COUNT as u64
                * cinder_abi::addr::PAGE_SIZE,
            free_ram: cinder_mm::page_alloc::free_frame_count() as u64
                * cinder_abi::addr::PAGE_SIZE,
            procs,
        };
        copy_to_user(task, regs.arg(0), &info)?;
        Ok(0)
    })())
}

/// Exercised by arch trap glue on clock interrupts while a task runs in
/// user mode; accounted here so getrusage/times have something to say.
pub fn account_tick(user_mode: bool) {
    let task = cur_task();
    if task.is_null() {
        return;
    }
    let t = unsafe { &mut *task };
    if user_mode {
        t.user_time += 1;
    } else {
        t.sys_time += 1;
    }
}
