//! Task-layer integration tests: demand paging, fork/COW, signal
//! delivery with syscall restart, regions, and the shm bridge — driven
//! through the same entry points the trap glue uses.

use std::sync::{Mutex, MutexGuard, Once};

use cinder_abi::addr::PAGE_SIZE;
use cinder_abi::errno::Errno;
use cinder_abi::fs::{O_CREAT, O_RDWR, PROT_READ, PROT_WRITE, to_devid};
use cinder_abi::ipc::{IPC_CREAT, IPC_PRIVATE, IPC_RMID};
use cinder_abi::signal::{
    SA_NODEFER, SA_RESTART, SA_RESTORER, SIGCHLD, SIGKILL, SIGTERM, SIGUSR1, SIGUSR2, sig_bit,
    wifexited, wifsignaled,
};
use cinder_abi::syscall::{SYS_READ, SYS_SIGRETURN};
use cinder_abi::task::TaskState;
use cinder_fs::blockdev::{RAMDISK_MAJOR, ramdisk_create, ramdisk_init};
use cinder_fs::fileio::closef;
use cinder_fs::memfs::{memfs_format, memfs_init};
use cinder_fs::mount::vfs_mount_root;
use cinder_fs::pipefs::pipe_create;
use cinder_fs::vfs::vfs_open;
use cinder_mm::page_alloc::get_frame_shares;

use crate::fault::user_frame_at;
use crate::lifecycle::{do_fork, do_waitpid, task_fs_context, terminate_task};
use crate::memregion::{
    MEMREGION_FLAG_PRIVATE, MEMREGION_FLAG_USER, MEMREGION_TYPE_DATA, memregion_alloc_and_attach,
    memregion_change_prot, memregion_containing,
};
use crate::regs::Regs;
use crate::sched::cur_task;
use crate::shm::{shmat, shmctl, shmdt, shmget};
use crate::signal::{add_task_signal, check_pending_signals};
use crate::syscall::syscall_dispatcher;
use crate::task::{SigAction, Task, fd_install, task_find_by_id};
use crate::user_copy::{copy_from_user_bytes, copy_to_user_bytes};

static CORE_LOCK: Mutex<()> = Mutex::new(());
static INIT: Once = Once::new();

const ROOT_DEV: u32 = to_devid(RAMDISK_MAJOR, 4);

fn with_core() -> MutexGuard<'static, ()> {
    let guard = CORE_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    INIT.call_once(|| {
        ramdisk_init();
        memfs_init();
        ramdisk_create(4, 4096, 512).unwrap();
        memfs_format(ROOT_DEV, 4096, 256, 512).unwrap();
        vfs_mount_root(ROOT_DEV, b"memfs").unwrap();
        crate::tasking_init().unwrap();
    });
    // Each test starts with a quiet pending set (earlier tests may have
    // left a SIGCHLD behind).
    let t = cur_task();
    if !t.is_null() {
        unsafe { &*t }
            .signal_pending
            .store(0, std::sync::atomic::Ordering::Release);
    }
    guard
}

fn me() -> *mut Task {
    let t = cur_task();
    assert!(!t.is_null());
    t
}

/// Map a scratch anonymous region for a test and return its base.
fn map_anon(task: *mut Task, base: u64, pages: u64) -> u64 {
    memregion_alloc_and_attach(
        task,
        core::ptr::null_mut(),
        0,
        0,
        base,
        base + pages * PAGE_SIZE,
        PROT_READ | PROT_WRITE,
        MEMREGION_TYPE_DATA,
        MEMREGION_FLAG_PRIVATE | MEMREGION_FLAG_USER,
        false,
    )
    .unwrap();
    base
}

fn unmap(task: *mut Task, base: u64, pages: u64) {
    let _ = crate::memregion::memregion_remove_overlaps(task, base, base + pages * PAGE_SIZE);
}

fn install_action(task: *mut Task, signum: u8, flags: u64) {
    let sig = unsafe { &mut *(*task).sig };
    sig.actions[(signum - 1) as usize] = SigAction {
        handler: 0x50_0000,
        mask: 0,
        flags: flags | SA_RESTORER,
        restorer: 0x50_0100,
    };
}

#[test]
fn test_demand_paging_zero_fill() {
    let _g = with_core();
    let task = me();
    let base = map_anon(task, 0x60_0000, 2);

    let mut buf = [0xFFu8; 64];
    copy_from_user_bytes(task, base + 100, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    copy_to_user_bytes(task, base + 100, b"hello").unwrap();
    copy_from_user_bytes(task, base + 100, &mut buf[..5]).unwrap();
    assert_eq!(&buf[..5], b"hello");

    unmap(task, base, 2);
}

#[test]
fn test_fault_outside_regions_is_efault() {
    let _g = with_core();
    let task = me();
    let mut buf = [0u8; 4];
    let err = copy_from_user_bytes(task, 0x7f00_0000, &mut buf).unwrap_err();
    assert_eq!(err, Errno::EFAULT);
    // The failed access queued SIGSEGV.
    let pending = unsafe { &*task }
        .signal_pending
        .load(std::sync::atomic::Ordering::Acquire);
    assert!(pending & sig_bit(cinder_abi::signal::SIGSEGV) != 0);
    unsafe { &*task }
        .signal_pending
        .store(0, std::sync::atomic::Ordering::Release);
}

#[test]
fn test_fork_copy_on_write() {
    let _g = with_core();
    let parent = me();
    let addr = map_anon(parent, 0x70_0000, 1);

    copy_to_user_bytes(parent, addr, &[0xAA]).unwrap();
    let frame = user_frame_at(parent, addr);
    assert_eq!(get_frame_shares(frame), 1);

    let regs = Regs::zero();
    let child_pid = do_fork(parent, &regs, false).unwrap();
    let child = task_find_by_id(child_pid);
    assert!(!child.is_null());

    // Both map the same frame read-only now.
    assert_eq!(user_frame_at(child, addr), frame);
    assert_eq!(get_frame_shares(frame), 2);

    // Child's fork frame returns zero.
    assert_eq!(unsafe { (*child).kernel_regs.rax }, 0);

    // Child writes: the fault gives it a private frame.
    copy_to_user_bytes(child, addr, &[0xBB]).unwrap();
    let child_frame = user_frame_at(child, addr);
    assert_ne!(child_frame, frame);
    assert_eq!(get_frame_shares(frame), 1);

    let mut b = [0u8; 1];
    copy_from_user_bytes(parent, addr, &mut b).unwrap();
    assert_eq!(b[0], 0xAA);
    copy_from_user_bytes(child, addr, &mut b).unwrap();
    assert_eq!(b[0], 0xBB);

    // Reap the child.
    terminate_task(child, cinder_abi::signal::w_exitcode(0, 0), false);
    let mut status = 0;
    let reaped = do_waitpid(parent, child_pid as i64, &mut status, 0).unwrap();
    assert_eq!(reaped, child_pid);
    assert!(wifexited(status));

    unmap(parent, addr, 1);
}

#[test]
fn test_private_file_mapping_leaves_file_unchanged() {
    let _g = with_core();
    let task = me();
    let ctx = task_fs_context(task);

    let file = vfs_open(&ctx, b"/cow-file.bin", O_CREAT | O_RDWR, 0o644, core::ptr::null_mut())
        .unwrap();
    let node = unsafe { (*file).node };
    let mut pos = 0u64;
    cinder_fs::vfs::vfs_write_node(node, &mut pos, &[0x11u8; 4096]).unwrap();

    // Map it privately and write through the mapping.
    let base = 0x72_0000;
    memregion_alloc_and_attach(
        task,
        node,
        0,
        4096,
        base,
        base + PAGE_SIZE,
        PROT_READ | PROT_WRITE,
        MEMREGION_TYPE_DATA,
        MEMREGION_FLAG_PRIVATE | MEMREGION_FLAG_USER,
        false,
    )
    .unwrap();

    let mut b = [0u8; 4];
    copy_from_user_bytes(task, base, &mut b).unwrap();
    assert_eq!(b, [0x11; 4]);

    copy_to_user_bytes(task, base, &[0x99, 0x99, 0x99, 0x99]).unwrap();

    // The file still reads the original bytes.
    let mut pos = 0u64;
    let mut back = [0u8; 4];
    cinder_fs::vfs::vfs_read_node(node, &mut pos, &mut back).unwrap();
    assert_eq!(back, [0x11; 4]);

    unmap(task, base, 1);
    closef(file);
    cinder_fs::vfs::vfs_unlink(&ctx, b"/cow-file.bin", false, core::ptr::null_mut()).unwrap();
}

#[test]
fn test_change_prot_splits_regions() {
    let _g = with_core();
    let task = me();
    let base = 0x74_0000;
    map_anon(task, base, 4);

    // Reprotect the middle two pages: the region splits in three.
    memregion_change_prot(
        task,
        base + PAGE_SIZE,
        base + 3 * PAGE_SIZE,
        PROT_READ,
        false,
    )
    .unwrap();

    let left = memregion_containing(task, base);
    let mid = memregion_containing(task, base + PAGE_SIZE);
    let right = memregion_containing(task, base + 3 * PAGE_SIZE);
    assert!(!left.is_null() && !mid.is_null() && !right.is_null());
    assert_ne!(left, mid);
    assert_ne!(mid, right);
    unsafe {
        assert_eq!((*left).size, 1);
        assert_eq!((*mid).size, 2);
        assert_eq!((*right).size, 1);
        assert_eq!((*mid).prot, PROT_READ);
        assert_eq!((*left).prot, PROT_READ | PROT_WRITE);
    }

    // Detach the middle; the hole faults.
    memregion_change_prot(task, base + PAGE_SIZE, base + 3 * PAGE_SIZE, 0, true).unwrap();
    assert!(memregion_containing(task, base + PAGE_SIZE).is_null());

    unmap(task, base, 4);
}

#[test]
fn test_signal_delivery_and_sigreturn_mask_law() {
    let _g = with_core();
    let task = me();
    let stack_base = map_anon(task, 0x76_0000, 4);
    let stack_top = stack_base + 4 * PAGE_SIZE;

    install_action(task, SIGUSR2, 0);

    let t = unsafe { &mut *task };
    let pre_mask = t.signal_mask;

    let mut regs = Regs::zero();
    regs.rip = 0x40_1234;
    regs.userrsp = stack_top - 64;
    regs.rax = 7;

    add_task_signal(task, SIGUSR2, None, true).unwrap();
    check_pending_signals(&mut regs);

    // Redirected into the handler, signal blocked (no SA_NODEFER).
    assert_eq!(regs.rip, 0x50_0000);
    assert_eq!(regs.rdi, SIGUSR2 as u64);
    assert!(t.signal_mask & sig_bit(SIGUSR2) != 0);

    // The restorer issues sigreturn; the frame sits just below userrsp.
    regs.userrsp += 8;
    regs.rax = SYS_SIGRETURN;
    syscall_dispatcher(task, &mut regs);

    assert_eq!(regs.rip, 0x40_1234);
    assert_eq!(regs.rax, 7);
    assert_eq!(t.signal_mask, pre_mask);
    assert!(!t.has_property(cinder_abi::task::PROPERTY_HANDLING_SIG));

    unmap(task, stack_base, 4);
}

#[test]
fn test_nodefer_leaves_signal_unblocked() {
    let _g = with_core();
    let task = me();
    let stack_base = map_anon(task, 0x90_0000, 2);

    install_action(task, SIGUSR1, SA_NODEFER);

    let mut regs = Regs::zero();
    regs.userrsp = stack_base + 2 * PAGE_SIZE - 64;
    add_task_signal(task, SIGUSR1, None, true).unwrap();
    check_pending_signals(&mut regs);

    let t = unsafe { &mut *task };
    assert_eq!(regs.rip, 0x50_0000);
    assert!(t.signal_mask & sig_bit(SIGUSR1) == 0);

    regs.userrsp += 8;
    regs.rax = SYS_SIGRETURN;
    syscall_dispatcher(task, &mut regs);

    unmap(task, stack_base, 2);
}

#[test]
fn test_pipe_read_interrupted_then_restarted() {
    let _g = with_core();
    let task = me();
    let stack_base = map_anon(task, 0x78_0000, 4);
    let stack_top = stack_base + 4 * PAGE_SIZE;
    let ubuf = stack_base; // scratch user memory for the read buffer

    let (rfile, wfile) = pipe_create().unwrap();
    let rfd = fd_install(unsafe { (*task).files }, rfile, 0, false).unwrap();

    install_action(task, SIGUSR1, SA_RESTART);

    // The signal is already pending when the read starts: the sleep
    // breaks immediately with ERESTARTSYS and the syscall number is
    // preserved.
    add_task_signal(task, SIGUSR1, None, true).unwrap();

    let mut regs = Regs::zero();
    regs.rip = 0x40_2000;
    regs.userrsp = stack_top - 128;
    regs.rax = SYS_READ;
    regs.rdi = rfd as u64;
    regs.rsi = ubuf;
    regs.rdx = 1;
    syscall_dispatcher(task, &mut regs);

    assert_eq!(regs.result(), Errno::ERESTARTSYS.as_neg());
    assert_eq!(unsafe { (*task).interrupted_syscall }, SYS_READ);

    // The writer side delivers one byte before the reader resumes.
    let node = unsafe { (*wfile).node };
    let write = unsafe { (*node).write }.unwrap();
    let mut wpos = 0u64;
    assert_eq!(write(wfile, &mut wpos, b"X").unwrap(), 1);

    // Delivery runs the handler...
    check_pending_signals(&mut regs);
    assert_eq!(regs.rip, 0x50_0000);

    // ...and sigreturn transparently restarts the read.
    regs.userrsp += 8;
    regs.rax = SYS_SIGRETURN;
    syscall_dispatcher(task, &mut regs);

    assert_eq!(regs.result(), 1);
    let mut b = [0u8; 1];
    copy_from_user_bytes(task, ubuf, &mut b).unwrap();
    assert_eq!(b[0], b'X');

    let _ = crate::task::fd_close(unsafe { (*task).files }, rfd);
    closef(wfile);
    unmap(task, stack_base, 4);
}

#[test]
fn test_pipe_read_interrupted_without_restart_is_eintr() {
    let _g = with_core();
    let task = me();
    let stack_base = map_anon(task, 0x7a_0000, 4);
    let stack_top = stack_base + 4 * PAGE_SIZE;

    let (rfile, wfile) = pipe_create().unwrap();
    let rfd = fd_install(unsafe { (*task).files }, rfile, 0, false).unwrap();

    install_action(task, SIGUSR1, 0); // no SA_RESTART

    add_task_signal(task, SIGUSR1, None, true).unwrap();

    let mut regs = Regs::zero();
    regs.userrsp = stack_top - 128;
    regs.rax = SYS_READ;
    regs.rdi = rfd as u64;
    regs.rsi = stack_base;
    regs.rdx = 1;
    syscall_dispatcher(task, &mut regs);
    assert_eq!(regs.result(), Errno::ERESTARTSYS.as_neg());

    // Delivery without SA_RESTART rewrites the pending result to EINTR
    // before the handler runs.
    check_pending_signals(&mut regs);
    assert_eq!(regs.rip, 0x50_0000);

    regs.userrsp += 8;
    regs.rax = SYS_SIGRETURN;
    syscall_dispatcher(task, &mut regs);
    assert_eq!(regs.result(), Errno::EINTR.as_neg());

    let _ = crate::task::fd_close(unsafe { (*task).files }, rfd);
    closef(wfile);
    unmap(task, stack_base, 4);
}

#[test]
fn test_kill_permission_and_default_terminate() {
    let _g = with_core();
    let parent = me();

    let regs = Regs::zero();
    let child_pid = do_fork(parent, &regs, false).unwrap();
    let child = task_find_by_id(child_pid);

    // An unprivileged stranger may not signal the child.
    unsafe {
        (*child).uid = 1000;
        (*child).ssuid = 1000;
        (*parent).uid = 2000;
        (*parent).euid = 2000;
    }
    assert_eq!(
        crate::signal::user_add_task_signal(child, SIGTERM, false).unwrap_err(),
        Errno::EPERM
    );
    unsafe {
        (*parent).uid = 0;
        (*parent).euid = 0;
    }

    // SIGKILL's default disposition terminates; the zombie reports the
    // signal in its status.
    add_task_signal(child, SIGKILL, None, true).unwrap();
    let mut child_regs = Regs::zero();
    // Deliver as if the child were returning to user mode.
    let saved = cur_task();
    crate::sched::set_cur_task(child);
    check_pending_signals(&mut child_regs);
    crate::sched::set_cur_task(saved);

    assert_eq!(unsafe { (*child).state() }, TaskState::Zombie);

    let mut status = 0;
    do_waitpid(parent, child_pid as i64, &mut status, 0).unwrap();
    assert!(wifsignaled(status));
    assert_eq!(status & 0x7f, SIGKILL as i32);

    // The parent was notified.
    let pending = unsafe { &*parent }
        .signal_pending
        .load(std::sync::atomic::Ordering::Acquire);
    assert!(pending & sig_bit(SIGCHLD) != 0);
    unsafe { &*parent }
        .signal_pending
        .store(0, std::sync::atomic::Ordering::Release);
}

#[test]
fn test_shm_shared_between_tasks() {
    let _g = with_core();
    let parent = me();

    let id = shmget(parent, IPC_PRIVATE, 2 * PAGE_SIZE, IPC_CREAT | 0o600).unwrap();
    let addr = shmat(parent, id, 0).unwrap();

    copy_to_user_bytes(parent, addr + 10, b"shared!").unwrap();

    // Fork: the child inherits the attachment.
    let regs = Regs::zero();
    let child_pid = do_fork(parent, &regs, false).unwrap();
    let child = task_find_by_id(child_pid);

    let mut buf = [0u8; 7];
    copy_from_user_bytes(child, addr + 10, &mut buf).unwrap();
    assert_eq!(&buf, b"shared!");

    // Writes from the child are visible to the parent: truly shared.
    copy_to_user_bytes(child, addr + 10, b"SHARED!").unwrap();
    copy_from_user_bytes(parent, addr + 10, &mut buf).unwrap();
    assert_eq!(&buf, b"SHARED!");

    // Detach everywhere, mark for removal, reap.
    shmdt(child, addr).unwrap();
    shmctl(parent, id, IPC_RMID, None).unwrap();
    shmdt(parent, addr).unwrap();

    terminate_task(child, 0, false);
    let mut status = 0;
    do_waitpid(parent, child_pid as i64, &mut status, 0).unwrap();
}

#[test]
fn test_stop_continue_conflict_cancellation() {
    let _g = with_core();
    let parent = me();
    let regs = Regs::zero();
    let child_pid = do_fork(parent, &regs, false).unwrap();
    let child = task_find_by_id(child_pid);
    let c = unsafe { &*child };

    add_task_signal(child, cinder_abi::signal::SIGSTOP, None, true).unwrap();
    assert!(
        c.signal_pending.load(std::sync::atomic::Ordering::Acquire)
            & sig_bit(cinder_abi::signal::SIGSTOP)
            != 0
    );

    // Posting SIGCONT cancels the pending stop.
    add_task_signal(child, cinder_abi::signal::SIGCONT, None, true).unwrap();
    let pending = c.signal_pending.load(std::sync::atomic::Ordering::Acquire);
    assert!(pending & sig_bit(cinder_abi::signal::SIGSTOP) == 0);

    terminate_task(child, 0, false);
    let mut status = 0;
    do_waitpid(parent, child_pid as i64, &mut status, 0).unwrap();
}
