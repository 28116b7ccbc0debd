//! Demand paging and copy-on-write.
//!
//! The page-fault handler resolves the faulting address against the task's
//! region list: an absent page is demand-loaded (zero-fill for anonymous
//! regions, through the page cache for file-backed ones), a write to a
//! COW-hinted page gets a private copy, and anything else earns SIGSEGV.

use cinder_abi::addr::{PAGE_SIZE, PhysAddr, VirtAddr, align_down};
use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::PROT_WRITE;
use cinder_abi::signal::{SEGV_ACCERR, SEGV_MAPERR, SIGSEGV};
use cinder_mm::page_alloc::{
    ALLOC_FLAG_ZERO, alloc_page_frame, dec_frame_shares, frame_virt, get_frame_shares,
};
use cinder_mm::paging::{
    ProcessPageDir, PteFlags, map_page_in_dir, pte_flags_in_dir, pte_set_flags,
    virt_to_phys_in_dir,
};

use cinder_fs::pcache::{
    get_cached_page, mark_cached_page_always_dirty, release_cached_page,
    release_cached_page_keep_share,
};

use crate::memregion::{MemRegion, memregion_containing};
use crate::signal::add_task_segv_signal;
use crate::task::Task;

/// Load the page covering `addr` into `pd` according to the region's
/// backing and protection. Anonymous pages are zero-filled; file-backed
/// pages come from the page cache — shared (or fully-covered) mappings
/// share the cache frame itself, private mappings that end mid-page get a
/// private copy with a zeroed tail.
pub fn memregion_load_page(
    region: *mut MemRegion,
    pd: *mut ProcessPageDir,
    addr: u64,
) -> KResult<()> {
    if region.is_null() || pd.is_null() {
        return Err(Errno::EINVAL);
    }
    let r = unsafe { &*region };
    let aligned = align_down(addr, PAGE_SIZE);

    let base_flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER;

    if r.inode.is_null() {
        let frame = alloc_page_frame(ALLOC_FLAG_ZERO);
        if frame.is_null() {
            return Err(Errno::ENOMEM);
        }
        if map_page_in_dir(pd, VirtAddr::new(aligned), frame, base_flags) != 0 {
            cinder_mm::free_page_frame(frame);
            return Err(Errno::ENOMEM);
        }
        return finish_protection(region, pd, aligned);
    }

    // Where this page's bytes live in the file, and where the mapping's
    // file window ends.
    let file_pos = r.fpos + (aligned - r.addr);
    let file_end = file_pos + PAGE_SIZE;
    let window_end = r.fpos + r.flen;

    let read_size = if file_end > window_end {
        let overhang = file_end - window_end;
        if overhang >= PAGE_SIZE {
            // The region was rounded up past its file window; this page
            // has no backing at all and reads as zeros.
            let frame = alloc_page_frame(ALLOC_FLAG_ZERO);
            if frame.is_null() {
                return Err(Errno::ENOMEM);
            }
            if map_page_in_dir(pd, VirtAddr::new(aligned), frame, base_flags) != 0 {
                cinder_mm::free_page_frame(frame);
                return Err(Errno::ENOMEM);
            }
            return finish_protection(region, pd, aligned);
        }
        (PAGE_SIZE - overhang) as usize
    } else {
        PAGE_SIZE as usize
    };

    let page = get_cached_page(r.inode, file_pos, 0);
    if page.is_null() {
        return Err(Errno::EIO);
    }

    if read_size == PAGE_SIZE as usize || !r.is_private() {
        // Map the cache frame itself; the caller's share from
        // get_cached_page becomes the mapping's share.
        let phys = unsafe { (*page).phys };
        if map_page_in_dir(pd, VirtAddr::new(aligned), phys, base_flags) != 0 {
            release_cached_page(page);
            return Err(Errno::ENOMEM);
        }
        if r.prot & PROT_WRITE != 0 {
            // Writes through the mapping won't pass the VFS; keep the
            // page permanently collectible by the writeback sweeps.
            mark_cached_page_always_dirty(page);
        }
        release_cached_page_keep_share(page);
    } else {
        // Private mapping whose window ends inside this page: private
        // frame, partial copy, zero tail.
        let frame = alloc_page_frame(0);
        if frame.is_null() {
            release_cached_page(page);
            return Err(Errno::ENOMEM);
        }
        unsafe {
            core::ptr::copy_nonoverlapping((*page).virt, frame_virt(frame), read_size);
            core::ptr::write_bytes(
                frame_virt(frame).add(read_size),
                0,
                PAGE_SIZE as usize - read_size,
            );
        }
        if map_page_in_dir(pd, VirtAddr::new(aligned), frame, base_flags) != 0 {
            cinder_mm::free_page_frame(frame);
            release_cached_page(page);
            return Err(Errno::ENOMEM);
        }
        release_cached_page(page);
    }

    finish_protection(region, pd, aligned)
}

/// Apply the region's protection policy to a freshly-mapped page:
/// read-only regions lose WRITABLE; private regions get the PRIVATE hint,
/// and writable private pages go read-only with the COW hint so the first
/// write faults into a private copy.
fn finish_protection(region: *mut MemRegion, pd: *mut ProcessPageDir, aligned: u64) -> KResult<()> {
    let r = unsafe { &*region };
    let va = VirtAddr::new(aligned);
    let Some(mut flags) = pte_flags_in_dir(pd, va) else {
        return Err(Errno::ENOMEM);
    };

    if r.prot & PROT_WRITE == 0 {
        flags.remove(PteFlags::WRITABLE);
    }
    if r.is_private() {
        if r.prot & PROT_WRITE != 0 {
            flags.remove(PteFlags::WRITABLE);
            flags |= PteFlags::COW;
        }
        flags |= PteFlags::PRIVATE;
    }
    pte_set_flags(pd, va, flags);
    Ok(())
}

/// Break copy-on-write for a write to `addr`: the sole owner just gets the
/// page re-armed writable, otherwise a private copy replaces the shared
/// frame and the old frame loses one share.
pub fn copy_on_write_break(pd: *mut ProcessPageDir, addr: u64) -> KResult<()> {
    let aligned = align_down(addr, PAGE_SIZE);
    let va = VirtAddr::new(aligned);

    let Some(flags) = pte_flags_in_dir(pd, va) else {
        return Err(Errno::EFAULT);
    };
    if !flags.contains(PteFlags::COW) {
        return Err(Errno::EFAULT);
    }
    let phys = virt_to_phys_in_dir(pd, va);
    if phys.is_null() {
        return Err(Errno::EFAULT);
    }

    let mut new_flags = flags;
    new_flags.remove(PteFlags::COW);
    new_flags |= PteFlags::WRITABLE;

    if get_frame_shares(phys) == 1 {
        pte_set_flags(pd, va, new_flags);
        return Ok(());
    }

    let frame = alloc_page_frame(0);
    if frame.is_null() {
        return Err(Errno::ENOMEM);
    }
    unsafe {
        core::ptr::copy_nonoverlapping(frame_virt(phys), frame_virt(frame), PAGE_SIZE as usize);
    }
    if map_page_in_dir(pd, va, frame, new_flags) != 0 {
        cinder_mm::free_page_frame(frame);
        return Err(Errno::ENOMEM);
    }
    dec_frame_shares(phys);
    Ok(())
}

/// The page-fault entry point: resolve against the region list, demand-
/// load or COW-break, or convert the fault into SIGSEGV against the task.
pub fn page_fault_handler(task: *mut Task, addr: u64, write: bool) -> KResult<()> {
    if task.is_null() {
        return Err(Errno::EFAULT);
    }
    let vm = unsafe { (*task).mem };
    if vm.is_null() {
        return Err(Errno::EFAULT);
    }

    let region = memregion_containing(task, addr);
    if region.is_null() {
        add_task_segv_signal(task, SIGSEGV, SEGV_MAPERR, addr);
        return Err(Errno::EFAULT);
    }

    let pd = unsafe { (*vm).page_dir };
    let va = VirtAddr::new(align_down(addr, PAGE_SIZE));

    if let Some(flags) = pte_flags_in_dir(pd, va) {
        if write && flags.contains(PteFlags::COW) {
            return copy_on_write_break(pd, addr);
        }
        if write && !flags.contains(PteFlags::WRITABLE) {
            add_task_segv_signal(task, SIGSEGV, SEGV_ACCERR, addr);
            return Err(Errno::EFAULT);
        }
        // Present and permitted: a spurious or racing fault.
        return Ok(());
    }

    if write && unsafe { (*region).prot } & PROT_WRITE == 0 {
        add_task_segv_signal(task, SIGSEGV, SEGV_ACCERR, addr);
        return Err(Errno::EFAULT);
    }

    memregion_load_page(region, pd, addr)
}

/// Physical frame behind a user address, for diagnostics and the shm
/// bridge.
pub fn user_frame_at(task: *mut Task, addr: u64) -> PhysAddr {
    let vm = unsafe { (*task).mem };
    if vm.is_null() {
        return PhysAddr::NULL;
    }
    virt_to_phys_in_dir(unsafe { (*vm).page_dir }, VirtAddr::new(addr))
}
