//! Physical page-frame arena with per-frame share counts.
//!
//! Every physical frame the substrate hands out — page-cache pages, task
//! pages, pipe buffers, shared-memory segments — comes from here. A frame's
//! **share count** is the number of owners keeping it resident: the page
//! cache holds one share for the entry itself and one per borrower; a
//! mapped PTE holds one share per address space after fork. A frame is only
//! returned to the free list when its last share drops.
//!
//! The arena is a fixed block of kernel memory; frame 0 is reserved so that
//! `PhysAddr(0)` can act as the null sentinel.

use core::sync::atomic::{AtomicU32, Ordering};

use cinder_abi::addr::PhysAddr;
use cinder_lib::{IrqMutex, klog_error};

use crate::mm_constants::{FRAME_COUNT, PAGE_SIZE_USIZE};

pub const ALLOC_FLAG_ZERO: u32 = 0x01;

const FRAME_FREE: u8 = 0;
const FRAME_USED: u8 = 1;
const FRAME_RESERVED: u8 = 2;

const INVALID_FRAME: u32 = u32::MAX;

struct Frame {
    shares: AtomicU32,
    state: u8,
    next_free: u32,
}

impl Frame {
    const fn new() -> Self {
        Self {
            shares: AtomicU32::new(0),
            state: FRAME_FREE,
            next_free: INVALID_FRAME,
        }
    }
}

#[repr(C, align(4096))]
struct FrameArena([u8; FRAME_COUNT * PAGE_SIZE_USIZE]);

static mut ARENA: FrameArena = FrameArena([0; FRAME_COUNT * PAGE_SIZE_USIZE]);

struct Allocator {
    frames: [Frame; FRAME_COUNT],
    free_head: u32,
    free_count: u32,
    initialized: bool,
}

unsafe impl Send for Allocator {}

static ALLOCATOR: IrqMutex<Allocator> = IrqMutex::new(Allocator {
    frames: [const { Frame::new() }; FRAME_COUNT],
    free_head: INVALID_FRAME,
    free_count: 0,
    initialized: false,
});

fn init_locked(alloc: &mut Allocator) {
    // Frame 0 reserved: PhysAddr(0) is null.
    alloc.frames[0].state = FRAME_RESERVED;
    for i in (1..FRAME_COUNT).rev() {
        alloc.frames[i].next_free = alloc.free_head;
        alloc.free_head = i as u32;
    }
    alloc.free_count = (FRAME_COUNT - 1) as u32;
    alloc.initialized = true;
}

#[inline]
fn frame_index(phys: PhysAddr) -> usize {
    (phys.as_u64() as usize) / PAGE_SIZE_USIZE
}

/// Kernel-virtual address of a frame (its slot in the arena).
#[inline]
pub fn frame_virt(phys: PhysAddr) -> *mut u8 {
    let idx = frame_index(phys);
    debug_assert!(idx < FRAME_COUNT);
    // SAFETY: idx bounds-checked against the arena size.
    unsafe { ((&raw mut ARENA) as *mut u8).add(idx * PAGE_SIZE_USIZE) }
}

/// Allocate one frame. The returned frame starts with a share count of 1,
/// owned by the caller. Returns `PhysAddr::NULL` when the arena is empty.
pub fn alloc_page_frame(flags: u32) -> PhysAddr {
    let phys = {
        let mut alloc = ALLOCATOR.lock();
        if !alloc.initialized {
            init_locked(&mut alloc);
        }
        let idx = alloc.free_head;
        if idx == INVALID_FRAME {
            klog_error!("page_alloc: out of physical frames");
            return PhysAddr::NULL;
        }
        alloc.free_head = alloc.frames[idx as usize].next_free;
        alloc.free_count -= 1;
        let frame = &mut alloc.frames[idx as usize];
        frame.state = FRAME_USED;
        frame.next_free = INVALID_FRAME;
        frame.shares.store(1, Ordering::Release);
        PhysAddr::new(idx as u64 * PAGE_SIZE_USIZE as u64)
    };

    if flags & ALLOC_FLAG_ZERO != 0 {
        // SAFETY: freshly allocated frame, exclusively ours.
        unsafe { core::ptr::write_bytes(frame_virt(phys), 0, PAGE_SIZE_USIZE) };
    }
    phys
}

/// Drop one share. When the last share goes, the frame returns to the free
/// list. Unbalanced frees are diagnosed loudly rather than corrupting the
/// free list.
pub fn free_page_frame(phys: PhysAddr) {
    if phys.is_null() {
        return;
    }
    let idx = frame_index(phys);
    let mut alloc = ALLOCATOR.lock();
    if idx >= FRAME_COUNT || alloc.frames[idx].state != FRAME_USED {
        klog_error!("page_alloc: bad free of frame {:#x}", phys.as_u64());
        return;
    }
    let prev = alloc.frames[idx].shares.fetch_sub(1, Ordering::AcqRel);
    if prev == 0 {
        klog_error!("page_alloc: share underflow on frame {:#x}", phys.as_u64());
        alloc.frames[idx].shares.store(0, Ordering::Release);
        return;
    }
    if prev == 1 {
        let old_head = alloc.free_head;
        let frame = &mut alloc.frames[idx];
        frame.state = FRAME_FREE;
        frame.next_free = old_head;
        alloc.free_head = idx as u32;
        alloc.free_count += 1;
    }
}

/// Current share count of a frame.
pub fn get_frame_shares(phys: PhysAddr) -> u32 {
    if phys.is_null() {
        return 0;
    }
    let idx = frame_index(phys);
    if idx >= FRAME_COUNT {
        return 0;
    }
    let alloc = ALLOCATOR.lock();
    alloc.frames[idx].shares.load(Ordering::Acquire)
}

/// Add one share to a live frame.
pub fn inc_frame_shares(phys: PhysAddr) {
    if phys.is_null() {
        return;
    }
    let idx = frame_index(phys);
    let alloc = ALLOCATOR.lock();
    if idx >= FRAME_COUNT || alloc.frames[idx].state != FRAME_USED {
        klog_error!("page_alloc: inc_frame_shares on bad frame {:#x}", phys.as_u64());
        return;
    }
    alloc.frames[idx].shares.fetch_add(1, Ordering::AcqRel);
}

/// Drop one share without freeing; the count must stay above zero.
pub fn dec_frame_shares(phys: PhysAddr) {
    if phys.is_null() {
        return;
    }
    let idx = frame_index(phys);
    let alloc = ALLOCATOR.lock();
    if idx >= FRAME_COUNT || alloc.frames[idx].state != FRAME_USED {
        klog_error!("page_alloc: dec_frame_shares on bad frame {:#x}", phys.as_u64());
        return;
    }
    let prev = alloc.frames[idx].shares.fetch_sub(1, Ordering::AcqRel);
    if prev == 0 {
        alloc.frames[idx].shares.store(0, Ordering::Release);
        klog_error!("page_alloc: share underflow on frame {:#x}", phys.as_u64());
    }
}

/// Number of free frames (diagnostics).
pub fn free_frame_count() -> u32 {
    let mut alloc = ALLOCATOR.lock();
    if !alloc.initialized {
        init_locked(&mut alloc);
    }
    alloc.free_count
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_sync::LOCK;

    #[test]
    fn test_alloc_starts_with_one_share() {
        let _g = LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let p = alloc_page_frame(ALLOC_FLAG_ZERO);
        assert!(!p.is_null());
        assert_eq!(get_frame_shares(p), 1);
        free_page_frame(p);
        assert_eq!(get_frame_shares(p), 0);
    }

    #[test]
    fn test_shared_frame_survives_one_free() {
        let _g = LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let p = alloc_page_frame(0);
        inc_frame_shares(p);
        assert_eq!(get_frame_shares(p), 2);
        free_page_frame(p);
        assert_eq!(get_frame_shares(p), 1);
        free_page_frame(p);
    }

    #[test]
    fn test_zeroed_frame() {
        let _g = LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let p = alloc_page_frame(ALLOC_FLAG_ZERO);
        let v = frame_virt(p);
        for i in (0..PAGE_SIZE_USIZE).step_by(512) {
            assert_eq!(unsafe { *v.add(i) }, 0);
        }
        free_page_frame(p);
    }
}
