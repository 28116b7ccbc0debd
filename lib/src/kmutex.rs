//! Sleeping kernel mutex with holder tracking.
//!
//! Unlike `IrqMutex`, contended acquisition blocks the task on a wait
//! channel instead of spinning with interrupts off, so it is safe to hold
//! across disk I/O. The holder's task id is recorded so callers can detect
//! that *they* already own the lock — the page-cache writeback path relies
//! on this to refuse a recursive acquisition with `EAGAIN` instead of
//! deadlocking against itself.

use core::sync::atomic::{AtomicU32, Ordering};

use cinder_abi::task::INVALID_TASK_ID;

use crate::services;

/// Holder id used when no task context exists (early boot).
const ANON_HOLDER: u32 = u32::MAX;

pub struct KernelMutex {
    holder: AtomicU32,
}

const UNLOCKED: u32 = 0;

impl KernelMutex {
    pub const fn new() -> Self {
        Self {
            holder: AtomicU32::new(UNLOCKED),
        }
    }

    fn self_id() -> u32 {
        let id = services::current_task_id();
        if id == INVALID_TASK_ID { ANON_HOLDER } else { id }
    }

    /// Task id of the current holder, or `INVALID_TASK_ID` when free.
    #[inline]
    pub fn holder(&self) -> u32 {
        let h = self.holder.load(Ordering::Acquire);
        if h == UNLOCKED || h == ANON_HOLDER {
            INVALID_TASK_ID
        } else {
            h
        }
    }

    /// True when the calling task already owns this mutex.
    #[inline]
    pub fn held_by_current(&self) -> bool {
        let h = self.holder.load(Ordering::Acquire);
        h != UNLOCKED && h == Self::self_id()
    }

    pub fn try_lock(&self) -> bool {
        self.holder
            .compare_exchange(UNLOCKED, Self::self_id(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn lock(&self) {
        let me = Self::self_id();
        loop {
            if self
                .holder
                .compare_exchange(UNLOCKED, me, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            // Uninterruptible: lock holders finish quickly or sleep on
            // their own channels; a signal must not steal the slot.
            services::block_on(self as *const _ as usize, false, 0);
        }
    }

    pub fn unlock(&self) {
        self.holder.store(UNLOCKED, Ordering::Release);
        services::unblock_all(self as *const _ as usize);
    }

    pub fn guard(&self) -> KernelMutexGuard<'_> {
        self.lock();
        KernelMutexGuard { mutex: self }
    }
}

impl Default for KernelMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KernelMutexGuard<'a> {
    mutex: &'a KernelMutex,
}

impl Drop for KernelMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock() {
        let m = KernelMutex::new();
        assert_eq!(m.holder(), INVALID_TASK_ID);
        m.lock();
        assert!(m.held_by_current());
        m.unlock();
        assert_eq!(m.holder(), INVALID_TASK_ID);
    }

    #[test]
    fn test_try_lock_contended() {
        let m = KernelMutex::new();
        assert!(m.try_lock());
        assert!(!m.try_lock() || m.held_by_current());
        m.unlock();
    }
}
