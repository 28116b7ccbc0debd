//! Memory-management syscalls: brk, the mmap family, and the SysV
//! shared-memory entry points.

use cinder_abi::addr::PAGE_SIZE;
use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{
    MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE, MAP_SHARED, PROT_NONE, PROT_READ, PROT_WRITE,
};
use cinder_abi::ipc::ShmidDs;
use cinder_mm::mm_constants::USER_MEM_END;

use crate::memregion::{
    MEMREGION_FLAG_PRIVATE, MEMREGION_FLAG_SHARED, MEMREGION_FLAG_USER, MEMREGION_TYPE_DATA,
    memregion_alloc_and_attach, memregion_change_prot, memregion_check_overlaps,
    memregion_consolidate, memregion_remove_overlaps, msync_range,
};
use crate::regs::Regs;
use crate::shm;
use crate::syscall::{file_for, ok_or_neg};
use crate::task::Task;
use crate::user_copy::{copy_from_user, copy_to_user};

const MMAP_BASE: u64 = 0x1000_0000;

fn page_roundup(v: u64) -> u64 {
    v.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// brk(2): 0 queries; otherwise the data segment grows (new anonymous
/// pages demand-faulted) or shrinks (the tail unmapped).
pub fn sys_brk(task: *mut Task, regs: &mut Regs) -> i64 {
    let new_brk = regs.arg(0);
    let vm = unsafe { (*task).mem };
    if vm.is_null() {
        return Errno::ENOMEM.as_neg();
    }
    let v = unsafe { &mut *vm };

    if new_brk == 0 {
        return v.end_data as i64;
    }

    let aligned = page_roundup(new_brk);
    if aligned > USER_MEM_END || aligned < v.base_addr {
        return v.end_data as i64;
    }

    if aligned > v.end_data {
        if memregion_alloc_and_attach(
            task,
            core::ptr::null_mut(),
            0,
            0,
            v.end_data,
            aligned,
            PROT_READ | PROT_WRITE,
            MEMREGION_TYPE_DATA,
            MEMREGION_FLAG_PRIVATE | MEMREGION_FLAG_USER,
            false,
        )
        .is_err()
        {
            return v.end_data as i64;
        }
        memregion_consolidate(task);
        v.end_data = aligned;
    } else if aligned < v.end_data {
        let _ = memregion_remove_overlaps(task, aligned, v.end_data);
        v.end_data = aligned;
    }
    v.end_data as i64
}

fn find_free_range(task: *mut Task, bytes: u64) -> KResult<u64> {
    let mut candidate = MMAP_BASE;
    while candidate + bytes <= USER_MEM_END {
        if memregion_check_overlaps(task, candidate, candidate + bytes).is_ok() {
            return Ok(candidate);
        }
        candidate += bytes.max(PAGE_SIZE);
    }
    Err(Errno::ENOMEM)
}

pub fn sys_mmap(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let hint = regs.arg(0);
        let len = regs.arg(1);
        let prot = regs.arg(2) as u32;
        let flags = regs.arg(3) as u32;
        let fd = regs.arg(4) as i64 as i32;
        let off = regs.arg(5);

        if len == 0 || off % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        let shared = flags & MAP_SHARED != 0;
        let private = flags & MAP_PRIVATE != 0;
        if shared == private {
            return Err(Errno::EINVAL);
        }

        let bytes = page_roundup(len);
        let addr = if flags & MAP_FIXED != 0 {
            if hint % PAGE_SIZE != 0 || hint + bytes > USER_MEM_END {
                return Err(Errno::EINVAL);
            }
            hint
        } else if hint != 0
            && hint % PAGE_SIZE == 0
            && hint + bytes <= USER_MEM_END
            && memregion_check_overlaps(task, hint, hint + bytes).is_ok()
        {
            hint
        } else {
            find_free_range(task, bytes)?
        };

        let (inode, fpos, flen) = if flags & MAP_ANONYMOUS != 0 {
            (core::ptr::null_mut(), 0, 0)
        } else {
            let file = file_for(task, fd)?;
            let f = unsafe { &*file };
            if !f.readable() {
                return Err(Errno::EACCES);
            }
            if shared && prot & PROT_WRITE != 0 && !f.writable() {
                return Err(Errno::EACCES);
            }
            (f.node, off, len)
        };

        let mut rflags = MEMREGION_FLAG_USER;
        rflags |= if shared {
            MEMREGION_FLAG_SHARED
        } else {
            MEMREGION_FLAG_PRIVATE
        };

        memregion_alloc_and_attach(
            task,
            inode,
            fpos,
            flen,
            addr,
            addr + bytes,
            prot,
            MEMREGION_TYPE_DATA,
            rflags,
            flags & MAP_FIXED != 0,
        )?;
        memregion_consolidate(task);
        Ok(addr as i64)
    })())
}

pub fn sys_mprotect(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let addr = regs.arg(0);
        let len = regs.arg(1);
        let prot = regs.arg(2) as u32;
        if addr % PAGE_SIZE != 0 || len == 0 {
            return Err(Errno::EINVAL);
        }
        if prot & !(PROT_READ | PROT_WRITE | cinder_abi::fs::PROT_EXEC) != 0 && prot != PROT_NONE {
            return Err(Errno::EINVAL);
        }
        memregion_change_prot(task, addr, addr + page_roundup(len), prot, false)?;
        memregion_consolidate(task);
        Ok(0)
    })())
}

pub fn sys_munmap(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let addr = regs.arg(0);
        let len = regs.arg(1);
        if addr % PAGE_SIZE != 0 || len == 0 {
            return Err(Errno::EINVAL);
        }
        memregion_remove_overlaps(task, addr, addr + page_roundup(len))?;
        Ok(0)
    })())
}

pub fn sys_msync(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        msync_range(task, regs.arg(0), regs.arg(1), regs.arg(2) as u32)?;
        Ok(0)
    })())
}

// ---------------------------------------------------------------------------
// SysV shared memory
// ---------------------------------------------------------------------------

pub fn sys_shmget(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(
        shm::shmget(task, regs.arg(0) as i32, regs.arg(1), regs.arg(2) as u32).map(|id| id as i64),
    )
}

pub fn sys_shmat(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(shm::shmat(task, regs.arg(0) as i32, regs.arg(1)).map(|addr| addr as i64))
}

pub fn sys_shmdt(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg(shm::shmdt(task, regs.arg(0)).map(|_| 0))
}

pub fn sys_shmctl(task: *mut Task, regs: &mut Regs) -> i64 {
    ok_or_neg((|| {
        let id = regs.arg(0) as i32;
        let cmd = regs.arg(1) as u32;
        let ubuf = regs.arg(2);

        match cmd {
            cinder_abi::ipc::IPC_STAT => {
                let mut ds = ShmidDs::default();
                shm::shmctl(task, id, cmd, Some(&mut ds))?;
                copy_to_user(task, ubuf, &ds)?;
            }
            cinder_abi::ipc::IPC_SET => {
                let mut ds: ShmidDs = copy_from_user(task, ubuf)?;
                shm::shmctl(task, id, cmd, Some(&mut ds))?;
            }
            _ => shm::shmctl(task, id, cmd, None)?,
        }
        Ok(0)
    })())
}
