//! File and namespace syscalls.

use core::ptr;

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{
    AT_REMOVEDIR, AT_SYMLINK_FOLLOW, DevId, O_CLOEXEC, OPEN_MAX, PATH_MAX, POLLIN, POLLNVAL,
    POLLOUT, SEL_READ, SEL_WRITE, UserStat, s_isblk,
};
use cinder_abi::syscall::UserIoVec;
use cinder_fs::fileio::{File, closef, file_lseek, file_ref};
use cinder_fs::mount::{get_mount_info, vfs_mount, vfs_umount};
use cinder_fs::node::{Node, node_ref, release_node};
use cinder_fs::path::{FsContext, vfs_lookup};
use cinder_fs::pipefs::pipe_create;
use cinder_fs::vfs::{
    vfs_chmod, vfs_chown, vfs_check_dir_access, vfs_getdents, vfs_link, vfs_mkdir, vfs_open,
    vfs_readlink, vfs_rename, vfs_stat_node, vfs_symlink, vfs_unlink,
};

use crate::lifecycle::task_fs_context;
use crate::regs::Regs;
use crate::syscall::{file_for, ok_or_neg, path_from_user, start_node_for};
use crate::task::{Task, fd_close, fd_install};
use crate::user_copy::{copy_from_user, copy_to_user, copy_from_user_bytes, copy_to_user_bytes};

const IO_CHUNK: usize = 1024;

fn ctx_of(task: *mut Task) -> FsContext {
    task_fs_context(task)
}

// ---------------------------------------------------------------------------
// open / close
// ---------------------------------------------------------------------------

fn open_common(task: *mut Task, dirfd: i32, upath: u64, flags: u32, mode: u32) -> KResult<i64> {
    let path = path_from_user(task, upath)?;
    let start = start_node_for(task, dirfd)?;
    let ctx = ctx_of(task);

    let file = vfs_open(&ctx, path.bytes(), flags, mode, start)?;
    match fd_install(
        unsafe { (*task).files },
        file,
        0,
        flags & O_CLOEXEC != 0,
    ) {
        Ok(fd) => Ok(fd as i64),
        Err(e) => {
            closef(file);
            Err(e)
        }
    }
}

pub fn sys_open(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(open_common(
        task,
        cinder_abi::fs::AT_FDCWD,
        regs.arg(0),
        regs.arg(1) as u32,
        regs.arg(2) as u32,
    ))
}

pub fn sys_openat(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(open_common(
        task,
        regs.arg(0) as i32,
        regs.arg(1),
        regs.arg(2) as u32,
        regs.arg(3) as u32,
    ))
}

pub fn sys_close(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(fd_close(unsafe { (*task).files }, regs.arg(0) as i32).map(|_| 0))
}

// ---------------------------------------------------------------------------
// read / write family
// ---------------------------------------------------------------------------

fn do_read(task: *mut Task, file: *mut File, pos: &mut u64, ubuf: u64, count: usize) -> KResult<i64> {
    let f = unsafe { &*file };
    if !f.readable() {
        return Err(Errno::EBADF);
    }
    let node = f.node;
    let read = unsafe { (*node).read }.ok_or(Errno::EBADF)?;

    let mut kbuf = [0u8; IO_CHUNK];
    let mut total = 0usize;
    while total < count {
        let chunk = core::cmp::min(count - total, IO_CHUNK);
        let n = read(file, pos, &mut kbuf[..chunk])?;
        if n == 0 {
            break;
        }
        copy_to_user_bytes(task, ubuf + total as u64, &kbuf[..n])?;
        total += n;
        if n < chunk {
            break;
        }
    }
    Ok(total as i64)
}

fn do_write(task: *mut Task, file: *mut File, pos: &mut u64, ubuf: u64, count: usize) -> KResult<i64> {
    let f = unsafe { &*file };
    if !f.writable() {
        return Err(Errno::EBADF);
    }
    let node = f.node;
    let write = unsafe { (*node).write }.ok_or(Errno::EBADF)?;

    let mut kbuf = [0u8; IO_CHUNK];
    let mut total = 0usize;
    while total < count {
        let chunk = core::cmp::min(count - total, IO_CHUNK);
        copy_from_user_bytes(task, ubuf + total as u64, &mut kbuf[..chunk])?;
        let n = write(file, pos, &kbuf[..chunk])?;
        total += n;
        if n < chunk {
            break;
        }
    }
    Ok(total as i64)
}

pub fn sys_read(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let file = file_for(task, regs.arg(0) as i32)?;
        let mut pos = unsafe { (*file).pos };
        let res = do_read(task, file, &mut pos, regs.arg(1), regs.arg(2) as usize)?;
        unsafe { (*file).pos = pos };
        Ok(res)
    })())
}

pub fn sys_write(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let file = file_for(task, regs.arg(0) as i32)?;
        let mut pos = unsafe { (*file).pos };
        let res = do_write(task, file, &mut pos, regs.arg(1), regs.arg(2) as usize)?;
        unsafe { (*file).pos = pos };
        Ok(res)
    })())
}

pub fn sys_pread(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let file = file_for(task, regs.arg(0) as i32)?;
        let mut pos = regs.arg(3);
        do_read(task, file, &mut pos, regs.arg(1), regs.arg(2) as usize)
    })())
}

pub fn sys_pwrite(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let file = file_for(task, regs.arg(0) as i32)?;
        let mut pos = regs.arg(3);
        do_write(task, file, &mut pos, regs.arg(1), regs.arg(2) as usize)
    })())
}

fn iov_loop(
    task: *mut Task,
    regs: &mut Regs,
    write: bool,
    positional: bool,
) -> KResult<i64> {
    let file = file_for(task, regs.arg(0) as i32)?;
    let uiov = regs.arg(1);
    let iovcnt = regs.arg(2) as usize;
    if iovcnt > 64 {
        return Err(Errno::EINVAL);
    }

    let mut pos = if positional {
        regs.arg(3)
    } else {
        unsafe { (*file).pos }
    };

    let mut total = 0i64;
    for i in 0..iovcnt {
        let iov: UserIoVec =
            copy_from_user(task, uiov + (i * core::mem::size_of::<UserIoVec>()) as u64)?;
        if iov.iov_len == 0 {
            continue;
        }
        let n = if write {
            do_write(task, file, &mut pos, iov.iov_base, iov.iov_len as usize)?
        } else {
            do_read(task, file, &mut pos, iov.iov_base, iov.iov_len as usize)?
        };
        total += n;
        if (n as u64) < iov.iov_len {
            break;
        }
    }

    if !positional {
        unsafe { (*file).pos = pos };
    }
    Ok(total)
}

pub fn sys_readv(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(iov_loop(task, regs, false, false))
}

pub fn sys_writev(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(iov_loop(task, regs, true, false))
}

pub fn sys_preadv(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(iov_loop(task, regs, false, true))
}

pub fn sys_pwritev(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(iov_loop(task, regs, true, true))
}

pub fn sys_lseek(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let file = file_for(task, regs.arg(0) as i32)?;
        let off = file_lseek(file, regs.arg(1) as i64, regs.arg(2) as u32)?;
        Ok(off as i64)
    })())
}

// ---------------------------------------------------------------------------
// stat family
// ---------------------------------------------------------------------------

fn stat_common(task: *mut Task, dirfd: i32, upath: u64, ustat: u64, follow: bool) -> KResult<i64> {
    let path = path_from_user(task, upath)?;
    let start = start_node_for(task, dirfd)?;
    let ctx = ctx_of(task);
    let node = vfs_lookup(&ctx, path.bytes(), start, follow)?;
    let mut st = UserStat::default();
    vfs_stat_node(node, &mut st);
    release_node(node);
    copy_to_user(task, ustat, &st)?;
    Ok(0)
}

pub fn sys_stat(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(stat_common(task, cinder_abi::fs::AT_FDCWD, regs.arg(0), regs.arg(1), true))
}

pub fn sys_lstat(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(stat_common(task, cinder_abi::fs::AT_FDCWD, regs.arg(0), regs.arg(1), false))
}

pub fn sys_fstatat(task: *mut Task, regs: &mut Regs) -> i64 {
    let follow = regs.arg(3) as u32 & cinder_abi::fs::AT_SYMLINK_NOFOLLOW == 0;
    ok_or_neg(stat_common(task, regs.arg(0) as i32, regs.arg(1), regs.arg(2), follow))
}

pub fn sys_fstat(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let file = file_for(task, regs.arg(0) as i32)?;
        let mut st = UserStat::default();
        vfs_stat_node(unsafe { (*file).node }, &mut st);
        copy_to_user(task, regs.arg(1), &st)?;
        Ok(0)
    })())
}

// ---------------------------------------------------------------------------
// Namespace mutations
// ---------------------------------------------------------------------------

pub fn sys_link(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let old = path_from_user(task, regs.arg(0))?;
        let new = path_from_user(task, regs.arg(1))?;
        vfs_link(&ctx_of(task), old.bytes(), new.bytes(), false)?;
        Ok(0)
    })())
}

pub fn sys_linkat(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let old = path_from_user(task, regs.arg(1))?;
        let new = path_from_user(task, regs.arg(3))?;
        let follow = regs.arg(4) as u32 & AT_SYMLINK_FOLLOW != 0;
        vfs_link(&ctx_of(task), old.bytes(), new.bytes(), follow)?;
        Ok(0)
    })())
}

pub fn sys_unlink(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let path = path_from_user(task, regs.arg(0))?;
        vfs_unlink(&ctx_of(task), path.bytes(), false, ptr::null_mut())?;
        Ok(0)
    })())
}

pub fn sys_unlinkat(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let path = path_from_user(task, regs.arg(1))?;
        let start = start_node_for(task, regs.arg(0) as i32)?;
        let rmdir = regs.arg(2) as u32 & AT_REMOVEDIR != 0;
        vfs_unlink(&ctx_of(task), path.bytes(), rmdir, start)?;
        Ok(0)
    })())
}

pub fn sys_mkdir(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let path = path_from_user(task, regs.arg(0))?;
        vfs_mkdir(&ctx_of(task), path.bytes(), regs.arg(1) as u32, ptr::null_mut())?;
        Ok(0)
    })())
}

pub fn sys_mkdirat(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let path = path_from_user(task, regs.arg(1))?;
        let start = start_node_for(task, regs.arg(0) as i32)?;
        vfs_mkdir(&ctx_of(task), path.bytes(), regs.arg(2) as u32, start)?;
        Ok(0)
    })())
}

pub fn sys_rmdir(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let path = path_from_user(task, regs.arg(0))?;
        vfs_unlink(&ctx_of(task), path.bytes(), true, ptr::null_mut())?;
        Ok(0)
    })())
}

pub fn sys_rename(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let old = path_from_user(task, regs.arg(0))?;
        let new = path_from_user(task, regs.arg(1))?;
        vfs_rename(&ctx_of(task), old.bytes(), new.bytes())?;
        Ok(0)
    })())
}

pub fn sys_renameat(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let old = path_from_user(task, regs.arg(1))?;
        let new = path_from_user(task, regs.arg(3))?;
        vfs_rename(&ctx_of(task), old.bytes(), new.bytes())?;
        Ok(0)
    })())
}

pub fn sys_symlink(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let target = path_from_user(task, regs.arg(0))?;
        let link = path_from_user(task, regs.arg(1))?;
        vfs_symlink(&ctx_of(task), target.bytes(), link.bytes())?;
        Ok(0)
    })())
}

pub fn sys_readlink(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let path = path_from_user(task, regs.arg(0))?;
        let mut buf = [0u8; PATH_MAX];
        let cap = core::cmp::min(regs.arg(2) as usize, PATH_MAX);
        let len = vfs_readlink(&ctx_of(task), path.bytes(), &mut buf[..cap])?;
        copy_to_user_bytes(task, regs.arg(1), &buf[..len])?;
        Ok(len as i64)
    })())
}

pub fn sys_getdents(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let file = file_for(task, regs.arg(0) as i32)?;
        let count = core::cmp::min(regs.arg(2) as usize, 4096);
        let mut kbuf = [0u8; 4096];
        let mut pos = unsafe { (*file).pos };
        let n = vfs_getdents(unsafe { (*file).node }, &mut pos, &mut kbuf[..count])?;
        unsafe { (*file).pos = pos };
        copy_to_user_bytes(task, regs.arg(1), &kbuf[..n])?;
        Ok(n as i64)
    })())
}

// ---------------------------------------------------------------------------
// Working directory and root
// ---------------------------------------------------------------------------

/// Reconstruct the cwd's absolute path by walking ".." links upward and
/// asking each parent for the entry naming the child.
pub fn sys_getcwd(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let ctx = ctx_of(task);
        let mut buf = [0u8; PATH_MAX];
        let mut end = PATH_MAX;

        let mut cur = ctx.cwd;
        if cur.is_null() {
            return Err(Errno::ENOENT);
        }
        node_ref(cur);

        while cur != ctx.root {
            let parent = vfs_lookup(&ctx, b"..", cur, true)?;
            if parent == cur {
                release_node(parent);
                break;
            }
            let ops = unsafe { (*parent).ops }.ok_or(Errno::ENOENT)?;
            let loc = match ops.finddir_by_inode(parent, cur) {
                Ok(l) => l,
                Err(e) => {
                    release_node(parent);
                    release_node(cur);
                    return Err(e);
                }
            };
            let name = loc.name_bytes();
            if name.len() + 1 > end {
                cinder_fs::pcache::release_cached_page(loc.page);
                release_node(parent);
                release_node(cur);
                return Err(Errno::ERANGE);
            }
            end -= name.len();
            buf[end..end + name.len()].copy_from_slice(name);
            end -= 1;
            buf[end] = b'/';
            cinder_fs::pcache::release_cached_page(loc.page);
            release_node(cur);
            cur = parent;
        }
        release_node(cur);

        if end == PATH_MAX {
            end -= 1;
            buf[end] = b'/';
        }

        let len = PATH_MAX - end;
        if len + 1 > regs.arg(1) as usize {
            return Err(Errno::ERANGE);
        }
        copy_to_user_bytes(task, regs.arg(0), &buf[end..])?;
        copy_to_user_bytes(task, regs.arg(0) + len as u64, &[0u8])?;
        Ok(len as i64 + 1)
    })())
}

fn set_dir_anchor(task: *mut Task, node: *mut Node, root: bool) -> KResult<i64> {
    let ctx = ctx_of(task);
    vfs_check_dir_access(&ctx, node)?;
    let fs = unsafe { (*task).fs };
    if fs.is_null() {
        release_node(node);
        return Err(Errno::EINVAL);
    }
    let f = unsafe { &mut *fs };
    let old = if root { f.root } else { f.cwd };
    if root {
        f.root = node;
    } else {
        f.cwd = node;
    }
    if !old.is_null() {
        release_node(old);
    }
    Ok(0)
}

pub fn sys_chdir(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let path = path_from_user(task, regs.arg(0))?;
        let node = vfs_lookup(&ctx_of(task), path.bytes(), ptr::null_mut(), true)?;
        set_dir_anchor(task, node, false)
    })())
}

pub fn sys_fchdir(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let file = file_for(task, regs.arg(0) as i32)?;
        let node = unsafe { (*file).node };
        node_ref(node);
        set_dir_anchor(task, node, false)
    })())
}

pub fn sys_chroot(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        if unsafe { (*task).euid } != 0 {
            return Err(Errno::EPERM);
        }
        let path = path_from_user(task, regs.arg(0))?;
        let node = vfs_lookup(&ctx_of(task), path.bytes(), ptr::null_mut(), true)?;
        set_dir_anchor(task, node, true)
    })())
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

pub fn sys_chmod(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let path = path_from_user(task, regs.arg(0))?;
        let ctx = ctx_of(task);
        let node = vfs_lookup(&ctx, path.bytes(), ptr::null_mut(), true)?;
        let res = vfs_chmod(&ctx, node, regs.arg(1) as u32);
        release_node(node);
        res.map(|_| 0)
    })())
}

pub fn sys_chown(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let path = path_from_user(task, regs.arg(0))?;
        let ctx = ctx_of(task);
        let node = vfs_lookup(&ctx, path.bytes(), ptr::null_mut(), true)?;
        let res = vfs_chown(&ctx, node, regs.arg(1) as u32, regs.arg(2) as u32);
        release_node(node);
        res.map(|_| 0)
    })())
}

pub fn sys_umask(task: *mut Task, regs: &mut Regs) -> i64 {
    let fs = unsafe { (*task).fs };
    if fs.is_null() {
        return Errno::EINVAL.as_neg();
    }
    let f = unsafe { &mut *fs };
    let old = f.umask;
    f.umask = regs.arg(0) as u32 & 0o777;
    old as i64
}

// ---------------------------------------------------------------------------
// dup / pipes
// ---------------------------------------------------------------------------

pub fn sys_dup(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let file = file_for(task, regs.arg(0) as i32)?;
        file_ref(file);
        match fd_install(unsafe { (*task).files }, file, 0, false) {
            Ok(fd) => Ok(fd as i64),
            Err(e) => {
                closef(file);
                Err(e)
            }
        }
    })())
}

pub fn sys_dup2(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let oldfd = regs.arg(0) as i32;
        let newfd = regs.arg(1) as i32;
        let file = file_for(task, oldfd)?;
        if newfd < 0 || newfd as usize >= OPEN_MAX {
            return Err(Errno::EBADF);
        }
        if oldfd == newfd {
            return Ok(newfd as i64);
        }
        let _ = fd_close(unsafe { (*task).files }, newfd);
        file_ref(file);
        let tf = unsafe { &mut *(*task).files };
        tf.fd[newfd as usize] = file;
        tf.cloexec &= !(1 << newfd);
        Ok(newfd as i64)
    })())
}

fn pipe_common(task: *mut Task, ufds: u64, flags: u32) -> KResult<i64> {
    let (rfile, wfile) = pipe_create()?;
    let cloexec = flags & O_CLOEXEC != 0;
    let tf = unsafe { (*task).files };

    let rfd = match fd_install(tf, rfile, 0, cloexec) {
        Ok(fd) => fd,
        Err(e) => {
            closef(rfile);
            closef(wfile);
            return Err(e);
        }
    };
    let wfd = match fd_install(tf, wfile, 0, cloexec) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = fd_close(tf, rfd);
            closef(wfile);
            return Err(e);
        }
    };

    let fds = [rfd, wfd];
    copy_to_user(task, ufds, &fds)?;
    Ok(0)
}

pub fn sys_pipe(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(pipe_common(task, regs.arg(0), 0))
}

pub fn sys_pipe2(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(pipe_common(task, regs.arg(0), regs.arg(1) as u32))
}

// ---------------------------------------------------------------------------
// mount / umount
// ---------------------------------------------------------------------------

fn devid_for_source(task: *mut Task, upath: u64) -> KResult<DevId> {
    let path = path_from_user(task, upath)?;
    let ctx = ctx_of(task);
    let node = vfs_lookup(&ctx, path.bytes(), ptr::null_mut(), true)?;
    let n = unsafe { &*node };
    let res = if s_isblk(n.mode) {
        Ok(n.blocks[0] as DevId)
    } else {
        Err(Errno::EINVAL)
    };
    release_node(node);
    res
}

pub fn sys_mount(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        if unsafe { (*task).euid } != 0 {
            return Err(Errno::EPERM);
        }
        let dev = devid_for_source(task, regs.arg(0))?;
        let target = path_from_user(task, regs.arg(1))?;
        let mut fstype = [0u8; 16];
        let tlen = crate::user_copy::strncpy_from_user(task, regs.arg(2), &mut fstype)?;
        let flags = regs.arg(3) as u32;

        let ctx = ctx_of(task);
        let mpoint = vfs_lookup(&ctx, target.bytes(), ptr::null_mut(), true)?;
        match vfs_mount(dev, mpoint, &fstype[..tlen], flags) {
            Ok(()) => Ok(0),
            Err(e) => {
                release_node(mpoint);
                Err(e)
            }
        }
    })())
}

pub fn sys_umount(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        if unsafe { (*task).euid } != 0 {
            return Err(Errno::EPERM);
        }
        let target = path_from_user(task, regs.arg(0))?;
        let ctx = ctx_of(task);
        let node = vfs_lookup(&ctx, target.bytes(), ptr::null_mut(), true)?;
        let dev = unsafe { (*node).dev };
        release_node(node);
        if get_mount_info(dev).is_null() {
            return Err(Errno::EINVAL);
        }
        vfs_umount(dev)?;
        Ok(0)
    })())
}

// ---------------------------------------------------------------------------
// select / poll
// ---------------------------------------------------------------------------

/// Minimal select over 64-bit fd masks: readfds and writefds in, ready
/// masks out. Readiness goes through the per-node select entry points.
pub fn sys_select(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let nfds = core::cmp::min(regs.arg(0) as usize, 64);
        let urfds = regs.arg(1);
        let uwfds = regs.arg(2);
        let timeout_ticks = regs.arg(4);

        let rin: u64 = if urfds != 0 { copy_from_user(task, urfds)? } else { 0 };
        let win: u64 = if uwfds != 0 { copy_from_user(task, uwfds)? } else { 0 };

        let deadline = if timeout_ticks > 0 {
            cinder_lib::clock::ticks() + timeout_ticks
        } else {
            0
        };

        loop {
            let mut rout = 0u64;
            let mut wout = 0u64;
            let mut ready = 0i64;

            for fd in 0..nfds {
                let bit = 1u64 << fd;
                if rin & bit == 0 && win & bit == 0 {
                    continue;
                }
                let file = file_for(task, fd as i32)?;
                let node = unsafe { (*file).node };
                let select = unsafe { (*node).select };
                if rin & bit != 0 && select.map(|f| f(file, SEL_READ)).unwrap_or(true) {
                    rout |= bit;
                    ready += 1;
                }
                if win & bit != 0 && select.map(|f| f(file, SEL_WRITE)).unwrap_or(true) {
                    wout |= bit;
                    ready += 1;
                }
            }

            if ready > 0 || deadline == 0 {
                if urfds != 0 {
                    copy_to_user(task, urfds, &rout)?;
                }
                if uwfds != 0 {
                    copy_to_user(task, uwfds, &wout)?;
                }
                return Ok(ready);
            }
            if cinder_lib::clock::ticks() >= deadline {
                if urfds != 0 {
                    copy_to_user(task, urfds, &0u64)?;
                }
                if uwfds != 0 {
                    copy_to_user(task, uwfds, &0u64)?;
                }
                return Ok(0);
            }
            let res = crate::sched::block_task2(task as usize, 2);
            if res == Errno::EINTR.as_neg() as i32 {
                return Err(Errno::ERESTARTSYS);
            }
        }
    })())
}

#[repr(C)]
#[derive(Copy, Clone)]
struct UserPollFd {
    fd: i32,
    events: u16,
    revents: u16,
}

pub fn sys_poll(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let ufds = regs.arg(0);
        let nfds = core::cmp::min(regs.arg(1) as usize, OPEN_MAX);
        let timeout_ticks = regs.arg(2) as i64;

        let deadline = if timeout_ticks > 0 {
            cinder_lib::clock::ticks() + timeout_ticks as u64
        } else {
            0
        };

        loop {
            let mut ready = 0i64;
            for i in 0..nfds {
                let addr = ufds + (i * core::mem::size_of::<UserPollFd>()) as u64;
                let mut pfd: UserPollFd = copy_from_user(task, addr)?;
                pfd.revents = 0;
                if pfd.fd >= 0 {
                    match file_for(task, pfd.fd) {
                        Ok(file) => {
                            let node = unsafe { (*file).node };
                            let bits = unsafe { (*node).poll }
                                .map(|f| f(file))
                                .unwrap_or(POLLIN | POLLOUT);
                            pfd.revents = (bits & (pfd.events as u32 | POLLIN | POLLOUT)) as u16;
                            if pfd.revents != 0 {
                                ready += 1;
                            }
                        }
                        Err(_) => {
                            pfd.revents = POLLNVAL as u16;
                            ready += 1;
                        }
                    }
                }
                copy_to_user(task, addr, &pfd)?;
            }

            if ready > 0 || timeout_ticks == 0 {
                return Ok(ready);
            }
            if deadline != 0 && cinder_lib::clock::ticks() >= deadline {
                return Ok(0);
            }
            let res = crate::sched::block_task2(task as usize, 2);
            if res == Errno::EINTR.as_neg() as i32 {
                return Err(Errno::ERESTARTSYS);
            }
        }
    })())
}
