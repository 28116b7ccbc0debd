//! Memory-management constants.

pub use cinder_abi::addr::PAGE_SIZE;

pub const PAGE_SIZE_USIZE: usize = PAGE_SIZE as usize;

/// End of the user address space. Anything at or above this is kernel
/// territory and is rejected by the user-copy helpers.
pub const USER_MEM_END: u64 = 0x8000_0000;

/// Number of 4 KiB frames in the physical frame arena. Frame 0 is reserved
/// so a zero `PhysAddr` can serve as the null sentinel.
pub const FRAME_COUNT: usize = 4096;

/// Kernel heap arena size.
pub const KERNEL_HEAP_SIZE: usize = 8 * 1024 * 1024;
