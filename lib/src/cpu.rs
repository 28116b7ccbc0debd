//! CPU primitives: interrupt-flag control and spin hints.
//!
//! This is the only hardware seam in the support library. On bare metal the
//! interrupt flag is saved and cleared for real; in the hosted build (unit
//! tests) the functions degrade to no-ops so everything above them runs
//! unmodified.

pub const MAX_CPUS: usize = 8;

#[cfg(target_os = "none")]
mod imp {
    use x86_64::instructions::interrupts;

    #[inline]
    pub fn save_flags_cli() -> u64 {
        let enabled = interrupts::are_enabled();
        interrupts::disable();
        enabled as u64
    }

    #[inline]
    pub fn restore_flags(flags: u64) {
        if flags != 0 {
            interrupts::enable();
        }
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    #[inline]
    pub fn save_flags_cli() -> u64 {
        0
    }

    #[inline]
    pub fn restore_flags(_flags: u64) {}
}

pub use imp::{restore_flags, save_flags_cli};

/// Busy-wait hint used by spin loops and the blocking fallbacks.
#[inline]
pub fn relax() {
    core::hint::spin_loop();
}

/// The executing CPU's index. The scheduler keys its current-task slot on
/// this; a single-CPU build (and the hosted test build) always reports 0.
#[inline]
pub fn cpu_id() -> usize {
    0
}
