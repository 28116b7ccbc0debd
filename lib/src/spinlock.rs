//! Interrupt-safe spinlocks.
//!
//! `IrqMutex` is a **ticket lock** that disables interrupts while held:
//! each acquirer takes a monotonically-increasing ticket and spins until
//! `now_serving` matches, so CPUs acquire the lock in request order and no
//! waiter starves. `IrqRwLock` layers a reader count on the same idea.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crate::cpu;

pub struct IrqMutex<T> {
    next_ticket: AtomicU16,
    now_serving: AtomicU16,
    data: UnsafeCell<T>,
}

// SAFETY: exclusive access is guaranteed by ticket acquisition with
// interrupts disabled for the duration of the guard.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    saved_flags: u64,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU16::new(0),
            now_serving: AtomicU16::new(0),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let saved_flags = cpu::save_flags_cli();
        let ticket = self.next_ticket.fetch_add(1, Ordering::AcqRel);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            cpu::relax();
        }
        IrqMutexGuard {
            mutex: self,
            saved_flags,
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    /// Release the lock without a guard.
    ///
    /// # Safety
    /// Only valid during panic recovery when the guard was lost and no CPU
    /// is inside the critical section.
    pub unsafe fn force_unlock(&self) {
        self.now_serving
            .store(self.next_ticket.load(Ordering::Relaxed), Ordering::Release);
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the ticket.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the ticket.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.now_serving.fetch_add(1, Ordering::Release);
        cpu::restore_flags(self.saved_flags);
    }
}

/// Reader-writer spinlock with writer preference, interrupt-safe like
/// `IrqMutex`. Readers share; a writer drains readers first.
pub struct IrqRwLock<T> {
    /// Bit 31 set while a writer holds or wants the lock; low bits count
    /// active readers.
    state: AtomicU32,
    data: UnsafeCell<T>,
}

const WRITER: u32 = 1 << 31;

unsafe impl<T: Send> Send for IrqRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for IrqRwLock<T> {}

pub struct IrqRwReadGuard<'a, T> {
    lock: &'a IrqRwLock<T>,
    saved_flags: u64,
}

pub struct IrqRwWriteGuard<'a, T> {
    lock: &'a IrqRwLock<T>,
    saved_flags: u64,
}

impl<T> IrqRwLock<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> IrqRwReadGuard<'_, T> {
        let saved_flags = cpu::save_flags_cli();
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
            cpu::relax();
        }
        IrqRwReadGuard {
            lock: self,
            saved_flags,
        }
    }

    pub fn write(&self) -> IrqRwWriteGuard<'_, T> {
        let saved_flags = cpu::save_flags_cli();
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            cpu::relax();
        }
        IrqRwWriteGuard {
            lock: self,
            saved_flags,
        }
    }
}

impl<T> Deref for IrqRwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: readers exclude writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for IrqRwReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
        cpu::restore_flags(self.saved_flags);
    }
}

impl<T> Deref for IrqRwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer bit excludes everyone else.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqRwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer bit excludes everyone else.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqRwWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
        cpu::restore_flags(self.saved_flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutex_basic() {
        let m = IrqMutex::new(41);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 42);
        assert!(!m.is_locked());
    }

    #[test]
    fn test_rwlock_readers_share() {
        let l = IrqRwLock::new(7u32);
        let r1 = l.read();
        let r2 = l.read();
        assert_eq!(*r1 + *r2, 14);
    }

    #[test]
    fn test_mutex_threaded() {
        use std::sync::Arc;

        let m = Arc::new(IrqMutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 4000);
    }
}
