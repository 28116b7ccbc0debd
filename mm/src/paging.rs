//! Per-task page tables.
//!
//! The substrate maintains each task's user mappings as a two-level table of
//! page-table entries: frame address plus flag bits, including the COW and
//! PRIVATE software hints the fault path keys on. Arch MMU glue (out of
//! scope here) is what would load these into the hardware walker; everything
//! in the core reads and writes them through this module.

use core::ptr;

use bitflags::bitflags;
use cinder_abi::addr::{PAGE_SIZE, PhysAddr, VirtAddr};

use crate::kernel_heap::{kfree, kmalloc_zeroed};
use crate::mm_constants::USER_MEM_END;
use crate::page_alloc::free_page_frame;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        /// Copy-on-write hint: write faults allocate a private copy.
        const COW      = 1 << 9;
        /// Private-mapping hint: the frame must never be shared on fork.
        const PRIVATE  = 1 << 10;
    }
}

pub const PTE_FLAGS_MASK: u64 = 0xfff;

const ENTRIES_PER_TABLE: usize = 1024;
const TABLES_PER_DIR: usize = (USER_MEM_END as usize / 4096) / ENTRIES_PER_TABLE;

#[repr(C)]
struct PageTable {
    entries: [u64; ENTRIES_PER_TABLE],
}

/// A task's page directory.
#[repr(C)]
pub struct ProcessPageDir {
    tables: [*mut PageTable; TABLES_PER_DIR],
}

unsafe impl Send for ProcessPageDir {}

#[inline]
fn split(addr: VirtAddr) -> Option<(usize, usize)> {
    if addr.as_u64() >= USER_MEM_END {
        return None;
    }
    let page = (addr.as_u64() / PAGE_SIZE) as usize;
    Some((page / ENTRIES_PER_TABLE, page % ENTRIES_PER_TABLE))
}

/// Allocate an empty page directory. Returns null on heap exhaustion.
pub fn pagedir_alloc() -> *mut ProcessPageDir {
    kmalloc_zeroed(core::mem::size_of::<ProcessPageDir>()) as *mut ProcessPageDir
}

/// Free a directory and its tables. Mapped frames must already have been
/// released by the region layer; only table memory goes here.
pub fn pagedir_free(pd: *mut ProcessPageDir) {
    if pd.is_null() {
        return;
    }
    unsafe {
        for table in (*pd).tables.iter_mut() {
            if !table.is_null() {
                kfree(*table as *mut u8);
                *table = ptr::null_mut();
            }
        }
        kfree(pd as *mut u8);
    }
}

/// Read a PTE. Returns 0 for unmapped addresses.
pub fn pte_get(pd: *mut ProcessPageDir, addr: VirtAddr) -> u64 {
    let Some((ti, ei)) = split(addr) else {
        return 0;
    };
    unsafe {
        if pd.is_null() {
            return 0;
        }
        let table = (*pd).tables[ti];
        if table.is_null() {
            return 0;
        }
        (*table).entries[ei]
    }
}

fn pte_slot(pd: *mut ProcessPageDir, addr: VirtAddr, create: bool) -> *mut u64 {
    let Some((ti, ei)) = split(addr) else {
        return ptr::null_mut();
    };
    unsafe {
        if pd.is_null() {
            return ptr::null_mut();
        }
        let mut table = (*pd).tables[ti];
        if table.is_null() {
            if !create {
                return ptr::null_mut();
            }
            table = kmalloc_zeroed(core::mem::size_of::<PageTable>()) as *mut PageTable;
            if table.is_null() {
                return ptr::null_mut();
            }
            (*pd).tables[ti] = table;
        }
        &mut (*table).entries[ei] as *mut u64
    }
}

/// Map `addr` to `phys` with the given flags. Fails on kernel addresses and
/// heap exhaustion. Does not touch the frame's share count — ownership
/// accounting is the caller's business.
pub fn map_page_in_dir(pd: *mut ProcessPageDir, addr: VirtAddr, phys: PhysAddr, flags: PteFlags) -> i32 {
    let slot = pte_slot(pd, addr, true);
    if slot.is_null() {
        return -1;
    }
    unsafe {
        *slot = phys.as_u64() | (flags | PteFlags::PRESENT).bits();
    }
    0
}

/// Unmap `addr`, returning the frame it pointed at (null if not mapped).
pub fn unmap_page_in_dir(pd: *mut ProcessPageDir, addr: VirtAddr) -> PhysAddr {
    let slot = pte_slot(pd, addr, false);
    if slot.is_null() {
        return PhysAddr::NULL;
    }
    unsafe {
        let pte = *slot;
        if pte & PteFlags::PRESENT.bits() == 0 {
            return PhysAddr::NULL;
        }
        *slot = 0;
        PhysAddr::new(pte & !PTE_FLAGS_MASK)
    }
}

pub fn virt_to_phys_in_dir(pd: *mut ProcessPageDir, addr: VirtAddr) -> PhysAddr {
    let pte = pte_get(pd, addr);
    if pte & PteFlags::PRESENT.bits() == 0 {
        PhysAddr::NULL
    } else {
        PhysAddr::new(pte & !PTE_FLAGS_MASK)
    }
}

pub fn pte_flags_in_dir(pd: *mut ProcessPageDir, addr: VirtAddr) -> Option<PteFlags> {
    let pte = pte_get(pd, addr);
    if pte & PteFlags::PRESENT.bits() == 0 {
        None
    } else {
        Some(PteFlags::from_bits_truncate(pte & PTE_FLAGS_MASK))
    }
}

/// Rewrite the flag bits of a mapped page, keeping its frame.
pub fn pte_set_flags(pd: *mut ProcessPageDir, addr: VirtAddr, flags: PteFlags) -> i32 {
    let slot = pte_slot(pd, addr, false);
    if slot.is_null() {
        return -1;
    }
    unsafe {
        let pte = *slot;
        if pte & PteFlags::PRESENT.bits() == 0 {
            return -1;
        }
        *slot = (pte & !PTE_FLAGS_MASK) | (flags | PteFlags::PRESENT).bits();
    }
    0
}

/// Change the protection flag bits of every mapped page in `[start, end)`,
/// preserving the COW/PRIVATE hints.
pub fn change_range_flags(pd: *mut ProcessPageDir, start: VirtAddr, end: VirtAddr, flags: PteFlags) {
    let mut addr = start.as_u64();
    while addr < end.as_u64() {
        let va = VirtAddr::new(addr);
        if let Some(old) = pte_flags_in_dir(pd, va) {
            let hints = old & (PteFlags::COW | PteFlags::PRIVATE);
            // A COW page stays read-only until the write fault copies it.
            let mut new = flags | hints;
            if hints.contains(PteFlags::COW) {
                new.remove(PteFlags::WRITABLE);
            }
            pte_set_flags(pd, va, new);
        }
        addr += PAGE_SIZE;
    }
}

/// Unmap every present page in `[start, end)` and drop one share on each
/// frame.
pub fn unmap_range_free(pd: *mut ProcessPageDir, start: VirtAddr, end: VirtAddr) -> usize {
    let mut freed = 0;
    let mut addr = start.as_u64();
    while addr < end.as_u64() {
        let phys = unmap_page_in_dir(pd, VirtAddr::new(addr));
        if !phys.is_null() {
            free_page_frame(phys);
            freed += 1;
        }
        addr += PAGE_SIZE;
    }
    freed
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_sync::LOCK;
    use crate::page_alloc::{ALLOC_FLAG_ZERO, alloc_page_frame, get_frame_shares};

    #[test]
    fn test_map_unmap() {
        let _g = LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let pd = pagedir_alloc();
        let frame = alloc_page_frame(ALLOC_FLAG_ZERO);
        let va = VirtAddr::new(0x40_0000);

        assert_eq!(
            map_page_in_dir(pd, va, frame, PteFlags::WRITABLE | PteFlags::USER),
            0
        );
        assert_eq!(virt_to_phys_in_dir(pd, va), frame);
        let flags = pte_flags_in_dir(pd, va).unwrap();
        assert!(flags.contains(PteFlags::WRITABLE));

        assert_eq!(unmap_page_in_dir(pd, va), frame);
        assert!(virt_to_phys_in_dir(pd, va).is_null());
        free_page_frame(frame);
        pagedir_free(pd);
    }

    #[test]
    fn test_kernel_addresses_rejected() {
        let _g = LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let pd = pagedir_alloc();
        let frame = alloc_page_frame(0);
        assert_eq!(
            map_page_in_dir(pd, VirtAddr::new(USER_MEM_END), frame, PteFlags::USER),
            -1
        );
        free_page_frame(frame);
        pagedir_free(pd);
    }

    #[test]
    fn test_change_range_preserves_cow() {
        let _g = LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let pd = pagedir_alloc();
        let frame = alloc_page_frame(0);
        let va = VirtAddr::new(0x1000);
        map_page_in_dir(pd, va, frame, PteFlags::USER | PteFlags::COW);

        change_range_flags(
            pd,
            va,
            VirtAddr::new(0x2000),
            PteFlags::USER | PteFlags::WRITABLE,
        );
        let flags = pte_flags_in_dir(pd, va).unwrap();
        assert!(flags.contains(PteFlags::COW));
        assert!(!flags.contains(PteFlags::WRITABLE));

        unmap_range_free(pd, va, VirtAddr::new(0x2000));
        assert_eq!(get_frame_shares(frame), 0);
        pagedir_free(pd);
    }
}
