//! Kernel heap: first-fit `kmalloc`/`kfree` over a static arena.
//!
//! Allocations are 16-byte aligned and carry a hidden header recording the
//! block size. Freed blocks go onto an address-sorted free list and adjacent
//! free blocks coalesce, so long-running churn (page-cache entries, memory
//! regions, page tables) does not fragment the arena into uselessness.

use core::ptr;

use cinder_lib::IrqMutex;

use crate::mm_constants::KERNEL_HEAP_SIZE;

const ALIGN: usize = 16;
const HEADER_SIZE: usize = 16;

#[repr(C, align(16))]
struct HeapArena([u8; KERNEL_HEAP_SIZE]);

static mut ARENA: HeapArena = HeapArena([0; KERNEL_HEAP_SIZE]);

#[repr(C)]
struct FreeBlock {
    size: usize,
    next: *mut FreeBlock,
}

struct HeapState {
    free_list: *mut FreeBlock,
    initialized: bool,
    bytes_free: usize,
}

unsafe impl Send for HeapState {}

static HEAP: IrqMutex<HeapState> = IrqMutex::new(HeapState {
    free_list: ptr::null_mut(),
    initialized: false,
    bytes_free: 0,
});

fn arena_base() -> *mut u8 {
    (&raw mut ARENA) as *mut u8
}

unsafe fn init_locked(state: &mut HeapState) {
    let base = arena_base() as *mut FreeBlock;
    unsafe {
        (*base).size = KERNEL_HEAP_SIZE;
        (*base).next = ptr::null_mut();
    }
    state.free_list = base;
    state.bytes_free = KERNEL_HEAP_SIZE;
    state.initialized = true;
}

/// Allocate `size` bytes from the kernel heap. Returns null on exhaustion.
pub fn kmalloc(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }

    let need = (size + HEADER_SIZE + ALIGN - 1) & !(ALIGN - 1);
    let mut state = HEAP.lock();
    if !state.initialized {
        // SAFETY: first use, arena is exclusively ours under the lock.
        unsafe { init_locked(&mut state) };
    }

    let mut prev: *mut FreeBlock = ptr::null_mut();
    let mut cur = state.free_list;

    unsafe {
        while !cur.is_null() {
            if (*cur).size >= need {
                let remainder = (*cur).size - need;
                let chosen = cur;

                if remainder >= HEADER_SIZE + ALIGN {
                    // Split: the tail stays on the free list.
                    let tail = (cur as *mut u8).add(need) as *mut FreeBlock;
                    (*tail).size = remainder;
                    (*tail).next = (*cur).next;
                    if prev.is_null() {
                        state.free_list = tail;
                    } else {
                        (*prev).next = tail;
                    }
                    (*chosen).size = need;
                } else if prev.is_null() {
                    state.free_list = (*cur).next;
                } else {
                    (*prev).next = (*cur).next;
                }

                state.bytes_free -= (*chosen).size;
                let user = (chosen as *mut u8).add(HEADER_SIZE);
                // Header keeps only the size; the next pointer is dead in
                // allocated blocks.
                (*chosen).next = ptr::null_mut();
                return user;
            }
            prev = cur;
            cur = (*cur).next;
        }
    }

    ptr::null_mut()
}

/// Allocate and zero-fill.
pub fn kmalloc_zeroed(size: usize) -> *mut u8 {
    let p = kmalloc(size);
    if !p.is_null() {
        // SAFETY: p points at a block of at least `size` bytes.
        unsafe { ptr::write_bytes(p, 0, size) };
    }
    p
}

/// Return a block obtained from `kmalloc` to the heap.
pub fn kfree(user: *mut u8) {
    if user.is_null() {
        return;
    }

    let mut state = HEAP.lock();
    let block = unsafe { user.sub(HEADER_SIZE) } as *mut FreeBlock;

    unsafe {
        state.bytes_free += (*block).size;

        // Address-sorted insert.
        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut cur = state.free_list;
        while !cur.is_null() && cur < block {
            prev = cur;
            cur = (*cur).next;
        }

        (*block).next = cur;
        if prev.is_null() {
            state.free_list = block;
        } else {
            (*prev).next = block;
        }

        // Coalesce with the successor, then with the predecessor.
        if !cur.is_null() && (block as *mut u8).add((*block).size) == cur as *mut u8 {
            (*block).size += (*cur).size;
            (*block).next = (*cur).next;
        }
        if !prev.is_null() && (prev as *mut u8).add((*prev).size) == block as *mut u8 {
            (*prev).size += (*block).size;
            (*prev).next = (*block).next;
        }
    }
}

/// Free bytes remaining in the arena (diagnostics).
pub fn kheap_bytes_free() -> usize {
    let mut state = HEAP.lock();
    if !state.initialized {
        // SAFETY: first use under the lock.
        unsafe { init_locked(&mut state) };
    }
    state.bytes_free
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_sync::LOCK;

    #[test]
    fn test_alloc_free_roundtrip() {
        let _g = LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let before = kheap_bytes_free();
        let p = kmalloc(100);
        assert!(!p.is_null());
        unsafe { core::ptr::write_bytes(p, 0xAB, 100) };
        kfree(p);
        assert_eq!(kheap_bytes_free(), before);
    }

    #[test]
    fn test_zeroed() {
        let _g = LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let p = kmalloc_zeroed(256);
        assert!(!p.is_null());
        for i in 0..256 {
            assert_eq!(unsafe { *p.add(i) }, 0);
        }
        kfree(p);
    }

    #[test]
    fn test_many_blocks_coalesce() {
        let _g = LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let before = kheap_bytes_free();
        let mut ptrs = [core::ptr::null_mut(); 32];
        for slot in ptrs.iter_mut() {
            *slot = kmalloc(4096);
            assert!(!slot.is_null());
        }
        for p in ptrs {
            kfree(p);
        }
        assert_eq!(kheap_bytes_free(), before);
    }
}
