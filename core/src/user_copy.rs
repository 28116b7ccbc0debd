//! User-pointer access helpers.
//!
//! Every kernel read or write of a user address goes through here: the
//! range is checked against the user/kernel boundary, each page is
//! resolved through the task's page tables (faulting absent pages in
//! through the region layer, exactly as a hardware fault would), and a
//! failed resolution turns into `EFAULT` with SIGSEGV queued against the
//! offending task.

use cinder_abi::addr::{PAGE_SIZE, VirtAddr, align_down};
use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::PATH_MAX;
use cinder_abi::signal::{SEGV_MAPERR, SIGSEGV};
use cinder_mm::mm_constants::USER_MEM_END;
use cinder_mm::page_alloc::frame_virt;
use cinder_mm::paging::{PteFlags, pte_flags_in_dir, virt_to_phys_in_dir};

use crate::fault::{copy_on_write_break, page_fault_handler};
use crate::signal::add_task_segv_signal;
use crate::task::Task;

fn efault(task: *mut Task, addr: u64) -> Errno {
    add_task_segv_signal(task, SIGSEGV, SEGV_MAPERR, addr);
    Errno::EFAULT
}

/// Resolve one user page to its kernel alias, faulting it in if needed.
fn resolve_page(task: *mut Task, addr: u64, write: bool) -> KResult<*mut u8> {
    if addr >= USER_MEM_END {
        return Err(efault(task, addr));
    }
    let vm = unsafe { (*task).mem };
    if vm.is_null() {
        return Err(efault(task, addr));
    }
    let pd = unsafe { (*vm).page_dir };
    let page_va = VirtAddr::new(align_down(addr, PAGE_SIZE));

    // Two rounds: the first may demand-load or COW-break, the second must
    // observe a usable mapping.
    for _ in 0..2 {
        if let Some(flags) = pte_flags_in_dir(pd, page_va) {
            if write && flags.contains(PteFlags::COW) {
                copy_on_write_break(pd, page_va.as_u64()).map_err(|_| efault(task, addr))?;
                continue;
            }
            if write && !flags.contains(PteFlags::WRITABLE) {
                return Err(efault(task, addr));
            }
            let phys = virt_to_phys_in_dir(pd, page_va);
            if phys.is_null() {
                return Err(efault(task, addr));
            }
            return Ok(frame_virt(phys));
        }
        page_fault_handler(task, addr, write).map_err(|_| efault(task, addr))?;
    }
    Err(efault(task, addr))
}

/// Copy kernel bytes out to user memory.
pub fn copy_to_user_bytes(task: *mut Task, dst: u64, src: &[u8]) -> KResult<()> {
    let mut done = 0usize;
    while done < src.len() {
        let addr = dst + done as u64;
        let base = resolve_page(task, addr, true)?;
        let in_page = (addr % PAGE_SIZE) as usize;
        let chunk = core::cmp::min(src.len() - done, PAGE_SIZE as usize - in_page);
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr().add(done), base.add(in_page), chunk);
        }
        done += chunk;
    }
    Ok(())
}

/// Copy user bytes into a kernel buffer.
pub fn copy_from_user_bytes(task: *mut Task, src: u64, dst: &mut [u8]) -> KResult<()> {
    let mut done = 0usize;
    while done < dst.len() {
        let addr = src + done as u64;
        let base = resolve_page(task, addr, false)?;
        let in_page = (addr % PAGE_SIZE) as usize;
        let chunk = core::cmp::min(dst.len() - done, PAGE_SIZE as usize - in_page);
        unsafe {
            core::ptr::copy_nonoverlapping(base.add(in_page), dst.as_mut_ptr().add(done), chunk);
        }
        done += chunk;
    }
    Ok(())
}

/// Copy one plain-data value out to user memory.
pub fn copy_to_user<T: Copy>(task: *mut Task, dst: u64, value: &T) -> KResult<()> {
    let bytes = unsafe {
        core::slice::from_raw_parts((value as *const T) as *const u8, core::mem::size_of::<T>())
    };
    copy_to_user_bytes(task, dst, bytes)
}

/// Copy one plain-data value in from user memory.
pub fn copy_from_user<T: Copy>(task: *mut Task, src: u64) -> KResult<T> {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    {
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, core::mem::size_of::<T>())
        };
        copy_from_user_bytes(task, src, bytes)?;
    }
    Ok(unsafe { value.assume_init() })
}

/// Copy a NUL-terminated user string into `buf`; returns its length.
/// Overlong strings fail with `ENAMETOOLONG`.
pub fn strncpy_from_user(task: *mut Task, src: u64, buf: &mut [u8]) -> KResult<usize> {
    let cap = core::cmp::min(buf.len(), PATH_MAX);
    let mut len = 0usize;
    while len < cap {
        let addr = src + len as u64;
        let base = resolve_page(task, addr, false)?;
        let in_page = (addr % PAGE_SIZE) as usize;
        let chunk = core::cmp::min(cap - len, PAGE_SIZE as usize - in_page);
        for i in 0..chunk {
            let b = unsafe { *base.add(in_page + i) };
            if b == 0 {
                return Ok(len + i);
            }
            buf[len + i] = b;
        }
        len += chunk;
    }
    Err(Errno::ENAMETOOLONG)
}
