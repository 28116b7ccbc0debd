//! The kernel tick counter.
//!
//! Arch timer glue calls `clock_tick()` on every timer interrupt; everything
//! else (page-cache aging, sleep timeouts, accounting) reads `ticks()`.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt frequency the tick counter is calibrated to.
pub const HZ: u64 = 100;

pub const ONE_SECOND: u64 = HZ;
pub const ONE_MINUTE: u64 = 60 * HZ;
pub const TWO_MINUTES: u64 = 2 * ONE_MINUTE;

static TICKS: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Advance the tick counter. Called from the timer interrupt (or from a
/// test fixture standing in for it).
#[inline]
pub fn clock_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn clock_advance(n: u64) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}
