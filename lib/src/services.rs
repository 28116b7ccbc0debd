//! Kernel-services hook table.
//!
//! The support library and the mm/fs layers need three things from the task
//! layer: the identity of the current task, a way to sleep on a wait channel,
//! and a way to wake a channel's sleepers. Depending on `cinder-core` from
//! here would invert the crate graph, so the scheduler registers callbacks at
//! init instead. Until registration the fallbacks spin-yield, which keeps
//! early boot (and lock-free test setups) functional.
//!
//! A wait channel is an opaque address used purely as a rendezvous value.

use core::sync::atomic::{AtomicPtr, Ordering};

use cinder_abi::task::INVALID_TASK_ID;

/// Returns the current task id, or `INVALID_TASK_ID` outside task context.
pub type CurrentTaskFn = fn() -> u32;

/// Sleep on `channel`. `timeout_ticks == 0` means no timeout. Returns 0 on
/// wakeup, `-EINTR` when an interruptible sleep was broken by a signal,
/// `-EWOULDBLOCK`/`-EAGAIN` on timeout.
pub type BlockOnFn = fn(channel: usize, interruptible: bool, timeout_ticks: u64) -> i32;

/// Wake every task sleeping on `channel`; returns the number woken.
pub type UnblockAllFn = fn(channel: usize) -> usize;

/// Post a signal with the given si_code/address against the current task.
/// Used by the user-copy helpers (SIGSEGV) and the file-size limit check
/// (SIGXFSZ).
pub type PostSignalFn = fn(signum: u8, code: i32, addr: u64);

/// The current task's RLIMIT_FSIZE, for the generic file write path.
pub type FsizeLimitFn = fn() -> u64;

static CURRENT_TASK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static FSIZE_LIMIT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static BLOCK_ON: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static UNBLOCK_ALL: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static POST_SIGNAL: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn register_current_task(f: CurrentTaskFn) {
    CURRENT_TASK.store(f as *mut (), Ordering::Release);
}

pub fn register_block_on(f: BlockOnFn) {
    BLOCK_ON.store(f as *mut (), Ordering::Release);
}

pub fn register_unblock_all(f: UnblockAllFn) {
    UNBLOCK_ALL.store(f as *mut (), Ordering::Release);
}

pub fn register_post_signal(f: PostSignalFn) {
    POST_SIGNAL.store(f as *mut (), Ordering::Release);
}

pub fn register_fsize_limit(f: FsizeLimitFn) {
    FSIZE_LIMIT.store(f as *mut (), Ordering::Release);
}

#[inline]
pub fn current_fsize_limit() -> u64 {
    let ptr = FSIZE_LIMIT.load(Ordering::Acquire);
    if ptr.is_null() {
        return u64::MAX;
    }
    // SAFETY: only valid `FsizeLimitFn` pointers are stored.
    let f: FsizeLimitFn = unsafe { core::mem::transmute(ptr) };
    f()
}

#[inline]
pub fn current_task_id() -> u32 {
    let ptr = CURRENT_TASK.load(Ordering::Acquire);
    if ptr.is_null() {
        return INVALID_TASK_ID;
    }
    // SAFETY: only valid `CurrentTaskFn` pointers are stored.
    let f: CurrentTaskFn = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Sleep on a wait channel through the registered scheduler hook.
///
/// Fallback: one spin hint, then report a wakeup. Retry loops built on this
/// degrade to polling, which is correct (if wasteful) before the scheduler
/// exists.
#[inline]
pub fn block_on(channel: usize, interruptible: bool, timeout_ticks: u64) -> i32 {
    let ptr = BLOCK_ON.load(Ordering::Acquire);
    if ptr.is_null() {
        crate::cpu::relax();
        return 0;
    }
    // SAFETY: only valid `BlockOnFn` pointers are stored.
    let f: BlockOnFn = unsafe { core::mem::transmute(ptr) };
    f(channel, interruptible, timeout_ticks)
}

#[inline]
pub fn unblock_all(channel: usize) -> usize {
    let ptr = UNBLOCK_ALL.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: only valid `UnblockAllFn` pointers are stored.
    let f: UnblockAllFn = unsafe { core::mem::transmute(ptr) };
    f(channel)
}

#[inline]
pub fn post_signal_current(signum: u8, code: i32, addr: u64) {
    let ptr = POST_SIGNAL.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: only valid `PostSignalFn` pointers are stored.
    let f: PostSignalFn = unsafe { core::mem::transmute(ptr) };
    f(signum, code, addr)
}
