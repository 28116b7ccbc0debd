//! Task memory regions.
//!
//! Each task's address space is a sorted, doubly-linked list of typed
//! regions (TEXT, DATA, SHMEM, STACK, KERNEL), each an address range with
//! protection bits, mapping flags, and an optional backing-file window
//! `(fpos, flen)`. Region descriptors come from a free list backed by the
//! kernel heap.
//!
//! The interesting geometry lives in `memregion_change_prot`: an address
//! range may slice an existing region on either side, so every combination
//! of "split off a left remainder / split off a right remainder / consume
//! the middle / continue rightward" is enumerated below.

use core::ptr;

use cinder_abi::addr::{PAGE_SIZE, VirtAddr};
use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{MS_ASYNC, MS_INVALIDATE, MS_SYNC, PROT_NONE, PROT_WRITE};
use cinder_lib::IrqMutex;
use cinder_mm::paging::{PteFlags, change_range_flags, unmap_range_free, virt_to_phys_in_dir};
use cinder_mm::{kfree, kmalloc_zeroed};

use cinder_fs::node::{Node, node_ref, release_node};
use cinder_fs::pcache::{
    PCACHE_PEEK_ONLY, get_cached_page, mark_cached_page_dirty, release_cached_page,
    remove_cached_node_pages, sync_cached_page,
};

use crate::task::{Task, TaskVm};

pub const MEMREGION_TYPE_TEXT: u32 = 1;
pub const MEMREGION_TYPE_DATA: u32 = 2;
pub const MEMREGION_TYPE_SHMEM: u32 = 3;
pub const MEMREGION_TYPE_STACK: u32 = 4;
pub const MEMREGION_TYPE_KERNEL: u32 = 5;

pub const MEMREGION_FLAG_SHARED: u32 = 0x01;
pub const MEMREGION_FLAG_PRIVATE: u32 = 0x02;
pub const MEMREGION_FLAG_USER: u32 = 0x04;
pub const MEMREGION_FLAG_STICKY: u32 = 0x08;
pub const MEMREGION_FLAG_VDSO: u32 = 0x10;
pub const MEMREGION_FLAG_NORESERVE: u32 = 0x20;

#[repr(C)]
pub struct MemRegion {
    /// Backing file, null for anonymous mappings.
    pub inode: *mut Node,
    /// Start of the mapping's window in the file.
    pub fpos: u64,
    /// Size of the mapping's window in the file.
    pub flen: u64,
    pub prot: u32,
    pub rtype: u32,
    pub flags: u32,
    /// Mapping size in pages.
    pub size: u64,
    pub addr: u64,
    pub refs: u32,
    pub next_free: *mut MemRegion,
    pub next: *mut MemRegion,
    pub prev: *mut MemRegion,
}

unsafe impl Send for MemRegion {}

impl MemRegion {
    #[inline]
    pub fn end(&self) -> u64 {
        self.addr + self.size * PAGE_SIZE
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        self.flags & MEMREGION_FLAG_PRIVATE != 0
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.flags & MEMREGION_FLAG_SHARED != 0
    }
}

// ---------------------------------------------------------------------------
// Descriptor free list
// ---------------------------------------------------------------------------

struct FreeList {
    head: *mut MemRegion,
}

unsafe impl Send for FreeList {}

static FREELIST: IrqMutex<FreeList> = IrqMutex::new(FreeList {
    head: ptr::null_mut(),
});

fn memregion_first_free() -> *mut MemRegion {
    {
        let mut fl = FREELIST.lock();
        if !fl.head.is_null() {
            let r = fl.head;
            unsafe {
                fl.head = (*r).next_free;
                (*r).next_free = ptr::null_mut();
            }
            return r;
        }
    }
    kmalloc_zeroed(core::mem::size_of::<MemRegion>()) as *mut MemRegion
}

fn memregion_add_free(region: *mut MemRegion) {
    let mut fl = FREELIST.lock();
    unsafe {
        (*region).next = ptr::null_mut();
        (*region).prev = ptr::null_mut();
        (*region).inode = ptr::null_mut();
        (*region).next_free = fl.head;
    }
    fl.head = region;
}

/// Allocate a region descriptor. The inode reference, if any, is taken
/// here and dropped in `memregion_free`.
pub fn memregion_alloc(
    inode: *mut Node,
    prot: u32,
    rtype: u32,
    flags: u32,
) -> KResult<*mut MemRegion> {
    let region = memregion_first_free();
    if region.is_null() {
        return Err(Errno::ENOMEM);
    }
    unsafe {
        let r = &mut *region;
        r.inode = inode;
        r.fpos = 0;
        r.flen = 0;
        r.prot = prot;
        r.rtype = rtype;
        r.flags = flags;
        r.size = 0;
        r.addr = 0;
        r.refs = 1;
        r.next = ptr::null_mut();
        r.prev = ptr::null_mut();
    }
    if !inode.is_null() {
        node_ref(inode);
    }
    Ok(region)
}

/// Release a descriptor and its inode reference.
pub fn memregion_free(region: *mut MemRegion) {
    if region.is_null() {
        return;
    }
    unsafe {
        let inode = (*region).inode;
        (*region).inode = ptr::null_mut();
        if !inode.is_null() {
            release_node(inode);
        }
        (*region).refs = 0;
    }
    memregion_add_free(region);
}

// ---------------------------------------------------------------------------
// List plumbing
// ---------------------------------------------------------------------------

fn insert_sorted(vm: &mut TaskVm, region: *mut MemRegion) {
    unsafe {
        let addr = (*region).addr;
        let mut cur = vm.first_region;
        let mut prev: *mut MemRegion = ptr::null_mut();
        while !cur.is_null() && (*cur).addr < addr {
            prev = cur;
            cur = (*cur).next;
        }
        (*region).prev = prev;
        (*region).next = cur;
        if prev.is_null() {
            vm.first_region = region;
        } else {
            (*prev).next = region;
        }
        if cur.is_null() {
            vm.last_region = region;
        } else {
            (*cur).prev = region;
        }
    }
}

fn unlink_region(vm: &mut TaskVm, region: *mut MemRegion) {
    unsafe {
        if (*region).prev.is_null() {
            vm.first_region = (*region).next;
        } else {
            (*(*region).prev).next = (*region).next;
        }
        if (*region).next.is_null() {
            vm.last_region = (*region).prev;
        } else {
            (*(*region).next).prev = (*region).prev;
        }
        (*region).next = ptr::null_mut();
        (*region).prev = ptr::null_mut();
    }
}

/// The region containing `addr`, or null.
pub fn memregion_containing(task: *mut Task, addr: u64) -> *mut MemRegion {
    let vm = unsafe { (*task).mem };
    if vm.is_null() {
        return ptr::null_mut();
    }
    let mut cur = unsafe { (*vm).first_region };
    unsafe {
        while !cur.is_null() {
            if addr >= (*cur).addr && addr < (*cur).end() {
                return cur;
            }
            if (*cur).addr > addr {
                break;
            }
            cur = (*cur).next;
        }
    }
    ptr::null_mut()
}

/// `EEXIST` when `[start, end)` overlaps any region.
pub fn memregion_check_overlaps(task: *mut Task, start: u64, end: u64) -> KResult<()> {
    let vm = unsafe { (*task).mem };
    let mut cur = unsafe { (*vm).first_region };
    unsafe {
        while !cur.is_null() {
            if start < (*cur).end() && (*cur).addr < end {
                return Err(Errno::EEXIST);
            }
            cur = (*cur).next;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Attach / detach
// ---------------------------------------------------------------------------

/// Attach an allocated region at `attachat` for `size` pages. With
/// `remove_overlaps` (the MAP_FIXED case) anything in the way is detached
/// first.
pub fn memregion_attach(
    task: *mut Task,
    region: *mut MemRegion,
    attachat: u64,
    size_pages: u64,
    remove_overlaps: bool,
) -> KResult<()> {
    let end = attachat + size_pages * PAGE_SIZE;

    if remove_overlaps {
        let _ = memregion_change_prot(task, attachat, end, 0, true);
    } else {
        memregion_check_overlaps(task, attachat, end)?;
    }

    let vm = unsafe { &mut *(*task).mem };
    unsafe {
        (*region).addr = attachat;
        (*region).size = size_pages;
    }
    insert_sorted(vm, region);
    vm.image_size += size_pages;
    Ok(())
}

/// Allocate and attach in one step.
#[allow(clippy::too_many_arguments)]
pub fn memregion_alloc_and_attach(
    task: *mut Task,
    inode: *mut Node,
    fpos: u64,
    flen: u64,
    start: u64,
    end: u64,
    prot: u32,
    rtype: u32,
    flags: u32,
    remove_overlaps: bool,
) -> KResult<*mut MemRegion> {
    if end <= start || start % PAGE_SIZE != 0 {
        return Err(Errno::EINVAL);
    }
    let region = memregion_alloc(inode, prot, rtype, flags)?;
    unsafe {
        (*region).fpos = fpos;
        (*region).flen = flen;
    }
    let pages = (end - start) / PAGE_SIZE;
    if let Err(e) = memregion_attach(task, region, start, pages, remove_overlaps) {
        memregion_free(region);
        return Err(e);
    }
    Ok(region)
}

/// Flush a shared file-backed region's pages to its file (msync engine).
fn msync_region(region: *mut MemRegion, sz_bytes: u64, flags: u32) -> KResult<()> {
    let r = unsafe { &*region };
    let inode = r.inode;
    if inode.is_null() || !r.is_shared() {
        return Ok(());
    }

    let mut off = 0u64;
    while off < sz_bytes && off < r.flen {
        let page = get_cached_page(inode, r.fpos + off, PCACHE_PEEK_ONLY);
        if !page.is_null() {
            if flags & MS_SYNC != 0 {
                let _ = sync_cached_page(page);
            } else if flags & MS_ASYNC != 0 {
                mark_cached_page_dirty(page);
            }
            release_cached_page(page);
        }
        off += PAGE_SIZE;
    }
    if flags & MS_INVALIDATE != 0 {
        let _ = remove_cached_node_pages(inode);
    }
    Ok(())
}

/// Detach a region: flush shared file pages, unmap and release frames,
/// note shared-memory detachment, drop the descriptor.
pub fn memregion_detach(task: *mut Task, region: *mut MemRegion, free_pages: bool) -> KResult<()> {
    let vm = unsafe { &mut *(*task).mem };
    let r = unsafe { &*region };
    let start = r.addr;
    let end = r.end();

    if !r.inode.is_null() && r.is_shared() {
        let _ = msync_region(region, r.size * PAGE_SIZE, MS_SYNC);
    }

    if r.rtype == MEMREGION_TYPE_SHMEM {
        let first_phys = virt_to_phys_in_dir(vm.page_dir, VirtAddr::new(start));
        crate::shm::shm_region_detached(first_phys);
    }

    if free_pages {
        let freed = unmap_range_free(vm.page_dir, VirtAddr::new(start), VirtAddr::new(end));
        vm.image_size = vm.image_size.saturating_sub(freed as u64);
    }

    unlink_region(vm, region);
    memregion_free(region);
    Ok(())
}

/// Detach every user region. Called on exec and on final exit. A vforked
/// child leaves shared-memory attachments alone — they still belong to the
/// parent's address space.
pub fn memregion_detach_user(task: *mut Task, free_pages: bool) {
    let vm = unsafe { (*task).mem };
    if vm.is_null() {
        return;
    }
    let vfork = unsafe { (*task).has_property(cinder_abi::task::PROPERTY_VFORK) };

    let mut cur = unsafe { (*vm).first_region };
    while !cur.is_null() {
        let next = unsafe { (*cur).next };
        let rtype = unsafe { (*cur).rtype };
        if rtype != MEMREGION_TYPE_KERNEL && !(vfork && rtype == MEMREGION_TYPE_SHMEM) {
            let _ = memregion_detach(task, cur, free_pages);
        }
        cur = next;
    }
}

// ---------------------------------------------------------------------------
// Protection changes and unmapping: the nine-case split
// ---------------------------------------------------------------------------

/// Clone a slice of `src` covering `[start, end)` and insert it in the
/// task's list. The file window is adjusted by the caller.
fn alloc_and_insert(
    task: *mut Task,
    src: *mut MemRegion,
    start: u64,
    end: u64,
) -> KResult<*mut MemRegion> {
    let s = unsafe { &*src };
    let region = memregion_alloc(s.inode, s.prot, s.rtype, s.flags)?;
    unsafe {
        (*region).addr = start;
        (*region).size = (end - start) / PAGE_SIZE;
    }
    let vm = unsafe { &mut *(*task).mem };
    insert_sorted(vm, region);
    Ok(region)
}

fn prot_to_pte(prot: u32, user: bool) -> PteFlags {
    let mut flags = PteFlags::PRESENT;
    if prot & PROT_WRITE != 0 {
        flags |= PteFlags::WRITABLE;
    }
    if user {
        flags |= PteFlags::USER;
    }
    flags
}

/// Change the protection of `[start, end)`, or with `detach` remove the
/// range from the task entirely. Regions partially covered are split so
/// only the targeted range changes; splits keep the backing-file window
/// `(fpos, flen)` attached to the right bytes.
///
/// The possible overlaps of the target range with one region:
///
/// ```text
/// (A) target hangs off the right edge      (B) target is a right suffix
/// (C) target hangs off the left edge       (D) target is a left prefix
/// (E) target swallows a left-aligned       (F) target is strictly inside
/// (G) target swallows the whole region     (H) exact match
/// (I) target swallows a right-aligned
/// ```
pub fn memregion_change_prot(
    task: *mut Task,
    start: u64,
    end: u64,
    prot: u32,
    detach: bool,
) -> KResult<()> {
    let vm = unsafe { (*task).mem };
    if vm.is_null() {
        return Err(Errno::EINVAL);
    }

    let mut found = false;
    let mut start = start;
    let mut region = unsafe { (*vm).first_region };

    let pte = if prot != PROT_NONE {
        prot_to_pte(prot, true)
    } else {
        PteFlags::empty()
    };

    while !region.is_null() {
        let start2 = unsafe { (*region).addr };
        let end2 = unsafe { (*region).end() };

        // No overlap with this region.
        if end <= start2 || start >= end2 {
            region = unsafe { (*region).next };
            continue;
        }

        found = true;
        let mut split_left = false;
        let mut split_right = false;
        let break_loop;

        if start <= start2 {
            if end == end2 {
                // (H)/(I): change the whole region, done.
                break_loop = true;
            } else if end < end2 {
                // (C)/(D): change the left side, split off the right.
                split_right = true;
                break_loop = true;
            } else {
                // (E)/(G): change the whole region, keep walking right.
                break_loop = false;
            }
        } else if end == end2 {
            // (B): split off the left side, change the right.
            split_left = true;
            break_loop = true;
        } else if end < end2 {
            // (F): split both sides, change the middle.
            split_left = true;
            split_right = true;
            break_loop = true;
        } else {
            // (A): split off the left, change the rest, keep walking.
            split_left = true;
            break_loop = false;
        }

        if split_left {
            let tmp = alloc_and_insert(task, region, start2, start)?;
            unsafe {
                let r = &mut *region;
                r.addr = start;
                r.size -= (*tmp).size;

                if !r.inode.is_null() {
                    (*tmp).fpos = r.fpos;
                    (*tmp).flen = start - start2;
                    r.fpos += (*tmp).flen;
                    if (*tmp).flen >= r.flen {
                        (*tmp).flen = r.flen;
                        r.flen = 0;
                    } else {
                        r.flen -= (*tmp).flen;
                    }
                }
            }
        }

        if split_right {
            let tmp = alloc_and_insert(task, region, end, end2)?;
            unsafe {
                let r = &mut *region;
                r.size -= (*tmp).size;

                if !r.inode.is_null() {
                    (*tmp).fpos = r.fpos + (end - start2);
                    let tail = end2 - end;
                    if r.flen > tail {
                        (*tmp).flen = tail;
                        r.flen -= tail;
                    } else {
                        // The window ended before the split point; the
                        // right piece has no file backing left.
                        (*tmp).flen = 0;
                    }
                }
            }
        }

        let next = unsafe { (*region).next };

        if detach {
            memregion_detach(task, region, true)?;
        } else {
            unsafe {
                (*region).prot = prot;
                change_range_flags(
                    (*vm).page_dir,
                    VirtAddr::new((*region).addr),
                    VirtAddr::new((*region).end()),
                    pte,
                );
            }
        }

        if break_loop {
            break;
        }
        region = next;
        start = end2;
    }

    if found { Ok(()) } else { Err(Errno::EINVAL) }
}

/// Detach every region fragment in `[start, end)` (munmap).
pub fn memregion_remove_overlaps(task: *mut Task, start: u64, end: u64) -> KResult<()> {
    memregion_change_prot(task, start, end, 0, true)
}

// ---------------------------------------------------------------------------
// Consolidation
// ---------------------------------------------------------------------------

/// Merge adjacent regions with identical attributes (never shared-memory
/// attachments) and, for file-backed pairs, contiguous file windows.
pub fn memregion_consolidate(task: *mut Task) {
    let vm = unsafe { (*task).mem };
    if vm.is_null() {
        return;
    }
    let mut region = unsafe { (*vm).first_region };

    unsafe {
        while !region.is_null() && !(*region).next.is_null() {
            let next = (*region).next;
            let mergeable = (*region).end() == (*next).addr
                && (*region).rtype != MEMREGION_TYPE_SHMEM
                && (*region).inode == (*next).inode
                && (*region).rtype == (*next).rtype
                && (*region).prot == (*next).prot
                && (*region).flags == (*next).flags
                && ((*region).inode.is_null() || (*region).fpos + (*region).flen == (*next).fpos);

            if mergeable {
                if !(*region).inode.is_null() {
                    (*region).flen += (*next).flen;
                }
                (*region).size += (*next).size;
                let vm = &mut *(*task).mem;
                unlink_region(vm, next);
                memregion_free(next);
            } else {
                region = (*region).next;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fork duplication
// ---------------------------------------------------------------------------

/// Duplicate the parent's address space for fork: every region descriptor
/// is copied (inode references bumped, shared-memory attachments
/// re-registered) and every present page is remapped copy-on-write in
/// both directions — writable private pages lose WRITABLE and gain the
/// COW hint in parent and child alike.
pub fn task_mem_dup(parent: *mut Task, child: *mut Task) -> KResult<()> {
    let pvm = unsafe { &mut *(*parent).mem };
    let cvm = unsafe { &mut *(*child).mem };

    let _pg = pvm.mutex.guard();

    cvm.base_addr = pvm.base_addr;
    cvm.end_data = pvm.end_data;
    cvm.end_stack = pvm.end_stack;

    let mut cur = pvm.first_region;
    unsafe {
        while !cur.is_null() {
            let src = &*cur;
            let region = memregion_alloc(src.inode, src.prot, src.rtype, src.flags)?;
            {
                let r = &mut *region;
                r.fpos = src.fpos;
                r.flen = src.flen;
                r.addr = src.addr;
                r.size = src.size;
            }
            insert_sorted(cvm, region);

            let shared = src.is_shared() || src.rtype == MEMREGION_TYPE_SHMEM;

            let mut addr = src.addr;
            while addr < src.end() {
                let va = VirtAddr::new(addr);
                let phys = virt_to_phys_in_dir(pvm.page_dir, va);
                if !phys.is_null() {
                    if let Some(flags) = cinder_mm::paging::pte_flags_in_dir(pvm.page_dir, va) {
                        let child_flags = if shared {
                            flags
                        } else {
                            let mut f = flags;
                            if f.contains(PteFlags::WRITABLE) {
                                f.remove(PteFlags::WRITABLE);
                                f |= PteFlags::COW;
                                // The parent's page goes read-only too.
                                cinder_mm::paging::pte_set_flags(pvm.page_dir, va, f);
                            }
                            f
                        };
                        cinder_mm::inc_frame_shares(phys);
                        if cinder_mm::paging::map_page_in_dir(
                            cvm.page_dir,
                            va,
                            phys,
                            child_flags,
                        ) != 0
                        {
                            cinder_mm::free_page_frame(phys);
                            return Err(Errno::ENOMEM);
                        }
                        cvm.image_size += 1;
                    }
                }
                addr += PAGE_SIZE;
            }

            if src.rtype == MEMREGION_TYPE_SHMEM {
                let first = virt_to_phys_in_dir(cvm.page_dir, VirtAddr::new(src.addr));
                crate::shm::shm_region_attached(first);
            }

            cur = src.next;
        }
    }
    Ok(())
}

/// Tear the whole map down (task exit after reaping).
pub fn task_mem_free(task: *mut Task) {
    let vm = unsafe { (*task).mem };
    if vm.is_null() {
        return;
    }
    memregion_detach_user(task, true);
    unsafe {
        // Anything left (KERNEL-type, vfork-spared SHMEM) goes now.
        let mut cur = (*vm).first_region;
        while !cur.is_null() {
            let next = (*cur).next;
            let _ = memregion_detach(task, cur, true);
            cur = next;
        }
        cinder_mm::paging::pagedir_free((*vm).page_dir);
        (*vm).page_dir = ptr::null_mut();
        kfree(vm as *mut u8);
        (*task).mem = ptr::null_mut();
    }
}

/// msync syscall engine: find the region covering `[addr, addr+len)` and
/// flush/invalidate its file pages.
pub fn msync_range(task: *mut Task, addr: u64, len: u64, flags: u32) -> KResult<()> {
    if addr % PAGE_SIZE != 0 {
        return Err(Errno::EINVAL);
    }
    let region = memregion_containing(task, addr);
    if region.is_null() {
        return Err(Errno::ENOMEM);
    }
    msync_region(region, len, flags)
}
