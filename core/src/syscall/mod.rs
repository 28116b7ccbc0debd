//! The syscall dispatcher.
//!
//! The trap glue hands in the packed register frame; the number is routed
//! to its handler, the handler's signed result lands back in `rax`
//! (negative errno on failure), and an interruptible sleep broken by a
//! signal leaves `-ERESTARTSYS` plus the preserved syscall number for the
//! signal path to act on.

pub mod fs_calls;
pub mod mm_calls;
pub mod proc_calls;
pub mod signal_calls;

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::PATH_MAX;
use cinder_abi::syscall::*;
use cinder_fs::fileio::File;
use cinder_fs::node::Node;

use crate::regs::Regs;
use crate::task::{Task, fd_get};
use crate::user_copy::strncpy_from_user;

/// A pathname copied in from user space.
pub struct UserPath {
    buf: [u8; PATH_MAX],
    len: usize,
}

impl UserPath {
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

pub fn path_from_user(task: *mut Task, uptr: u64) -> KResult<UserPath> {
    let mut p = UserPath {
        buf: [0; PATH_MAX],
        len: 0,
    };
    p.len = strncpy_from_user(task, uptr, &mut p.buf)?;
    if p.len == 0 {
        return Err(Errno::ENOENT);
    }
    Ok(p)
}

/// Resolve a dirfd to the start node for an *at() call. `AT_FDCWD` (and
/// absolute paths) use the task's cwd, signalled by a null start.
pub fn start_node_for(task: *mut Task, dirfd: i32) -> KResult<*mut Node> {
    if dirfd == cinder_abi::fs::AT_FDCWD {
        return Ok(core::ptr::null_mut());
    }
    let file = fd_get(unsafe { (*task).files }, dirfd)?;
    Ok(unsafe { (*file).node })
}

pub fn file_for(task: *mut Task, fd: i32) -> KResult<*mut File> {
    fd_get(unsafe { (*task).files }, fd)
}

#[inline]
pub fn ok_or_neg(res: KResult<i64>) -> i64 {
    match res {
        Ok(v) => v,
        Err(e) => e.as_neg(),
    }
}

/// Route one syscall. Called from the trap path and from the restart
/// paths in the signal code.
pub fn syscall_dispatcher(task: *mut Task, regs: &mut Regs) {
    let nr = regs.rax;

    let res: i64 = match nr {
        SYS_READ => fs_calls::sys_read(task, regs),
        SYS_WRITE => fs_calls::sys_write(task, regs),
        SYS_OPEN => fs_calls::sys_open(task, regs),
        SYS_OPENAT => fs_calls::sys_openat(task, regs),
        SYS_CLOSE => fs_calls::sys_close(task, regs),
        SYS_STAT => fs_calls::sys_stat(task, regs),
        SYS_LSTAT => fs_calls::sys_lstat(task, regs),
        SYS_FSTAT => fs_calls::sys_fstat(task, regs),
        SYS_FSTATAT => fs_calls::sys_fstatat(task, regs),
        SYS_LSEEK => fs_calls::sys_lseek(task, regs),
        SYS_PREAD => fs_calls::sys_pread(task, regs),
        SYS_PWRITE => fs_calls::sys_pwrite(task, regs),
        SYS_READV => fs_calls::sys_readv(task, regs),
        SYS_WRITEV => fs_calls::sys_writev(task, regs),
        SYS_PREADV => fs_calls::sys_preadv(task, regs),
        SYS_PWRITEV => fs_calls::sys_pwritev(task, regs),
        SYS_LINK => fs_calls::sys_link(task, regs),
        SYS_LINKAT => fs_calls::sys_linkat(task, regs),
        SYS_UNLINK => fs_calls::sys_unlink(task, regs),
        SYS_UNLINKAT => fs_calls::sys_unlinkat(task, regs),
        SYS_MKDIR => fs_calls::sys_mkdir(task, regs),
        SYS_MKDIRAT => fs_calls::sys_mkdirat(task, regs),
        SYS_RMDIR => fs_calls::sys_rmdir(task, regs),
        SYS_RENAME => fs_calls::sys_rename(task, regs),
        SYS_RENAMEAT => fs_calls::sys_renameat(task, regs),
        SYS_SYMLINK => fs_calls::sys_symlink(task, regs),
        SYS_READLINK => fs_calls::sys_readlink(task, regs),
        SYS_GETDENTS => fs_calls::sys_getdents(task, regs),
        SYS_GETCWD => fs_calls::sys_getcwd(task, regs),
        SYS_CHDIR => fs_calls::sys_chdir(task, regs),
        SYS_FCHDIR => fs_calls::sys_fchdir(task, regs),
        SYS_CHROOT => fs_calls::sys_chroot(task, regs),
        SYS_CHMOD => fs_calls::sys_chmod(task, regs),
        SYS_CHOWN => fs_calls::sys_chown(task, regs),
        SYS_UMASK => fs_calls::sys_umask(task, regs),
        SYS_DUP => fs_calls::sys_dup(task, regs),
        SYS_DUP2 => fs_calls::sys_dup2(task, regs),
        SYS_PIPE => fs_calls::sys_pipe(task, regs),
        SYS_PIPE2 => fs_calls::sys_pipe2(task, regs),
        SYS_MOUNT => fs_calls::sys_mount(task, regs),
        SYS_UMOUNT => fs_calls::sys_umount(task, regs),
        SYS_SELECT => fs_calls::sys_select(task, regs),
        SYS_POLL => fs_calls::sys_poll(task, regs),

        SYS_FORK => proc_calls::sys_fork(task, regs),
        SYS_VFORK => proc_calls::sys_vfork(task, regs),
        SYS_EXECVE => proc_calls::sys_execve(task, regs),
        SYS_EXIT | SYS_EXIT_GROUP => proc_calls::sys_exit(task, regs),
        SYS_WAIT4 | SYS_WAITPID => proc_calls::sys_wait4(task, regs),
        SYS_KILL => proc_calls::sys_kill(task, regs),
        SYS_GETPID => proc_calls::sys_getpid(task, regs),
        SYS_GETPPID => proc_calls::sys_getppid(task, regs),
        SYS_SCHED_YIELD => proc_calls::sys_sched_yield(task, regs),
        SYS_SCHED_GETSCHEDULER => proc_calls::sys_sched_getscheduler(task, regs),
        SYS_SCHED_SETSCHEDULER => proc_calls::sys_sched_setscheduler(task, regs),
        SYS_GETRLIMIT => proc_calls::sys_getrlimit(task, regs),
        SYS_SETRLIMIT => proc_calls::sys_setrlimit(task, regs),
        SYS_PRLIMIT => proc_calls::sys_prlimit(task, regs),
        SYS_GETRUSAGE => proc_calls::sys_getrusage(task, regs),
        SYS_TIMES => proc_calls::sys_times(task, regs),
        SYS_UNAME => proc_calls::sys_uname(task, regs),
        SYS_SYSINFO => proc_calls::sys_sysinfo(task, regs),

        SYS_BRK => mm_calls::sys_brk(task, regs),
        SYS_MMAP => mm_calls::sys_mmap(task, regs),
        SYS_MPROTECT => mm_calls::sys_mprotect(task, regs),
        SYS_MUNMAP => mm_calls::sys_munmap(task, regs),
        SYS_MSYNC => mm_calls::sys_msync(task, regs),
        SYS_SHMGET => mm_calls::sys_shmget(task, regs),
        SYS_SHMAT => mm_calls::sys_shmat(task, regs),
        SYS_SHMDT => mm_calls::sys_shmdt(task, regs),
        SYS_SHMCTL => mm_calls::sys_shmctl(task, regs),

        SYS_SIGACTION => signal_calls::sys_sigaction(task, regs),
        SYS_SIGPROCMASK => signal_calls::sys_sigprocmask(task, regs),
        SYS_SIGPENDING => signal_calls::sys_sigpending(task, regs),
        SYS_SIGSUSPEND => signal_calls::sys_sigsuspend(task, regs),
        SYS_SIGTIMEDWAIT => signal_calls::sys_sigtimedwait(task, regs),
        SYS_SIGALTSTACK => signal_calls::sys_sigaltstack(task, regs),
        SYS_SIGRETURN => crate::signal::syscall_sigreturn(task, regs),

        _ => Errno::ENOSYS.as_neg(),
    };

    if res == Errno::ERESTARTSYS.as_neg() {
        // Preserve the number so the signal path can restart us
        // transparently under SA_RESTART.
        unsafe { (*task).interrupted_syscall = nr };
    }
    regs.set_result(res);
}
