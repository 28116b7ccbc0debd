//! SysV shared memory, bridged into the memory-region layer.
//!
//! A segment is a run of physical frames owned by the segment table; each
//! attachment is a SHMEM-type shared region whose pages map those frames
//! (every mapping counted on the frames' share counts). Detachment goes
//! through `memregion_detach`, which reports back here by the physical
//! frame of the region's first page; a segment marked for removal is
//! destroyed when its last attachment drops.

use cinder_abi::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{PROT_READ, PROT_WRITE};
use cinder_abi::ipc::{IPC_CREAT, IPC_EXCL, IPC_PRIVATE, ShmidDs};
use cinder_lib::{IrqMutex, klog_info};
use cinder_mm::page_alloc::{ALLOC_FLAG_ZERO, alloc_page_frame, free_page_frame, inc_frame_shares};
use cinder_mm::paging::{PteFlags, map_page_in_dir};

use crate::memregion::{
    MEMREGION_FLAG_SHARED, MEMREGION_FLAG_USER, MEMREGION_TYPE_SHMEM, memregion_alloc_and_attach,
    memregion_check_overlaps, memregion_containing, memregion_detach,
};
use crate::task::Task;

pub const SHMMNI: usize = 32;
pub const SHM_MAX_PAGES: usize = 16;

/// Bottom of the window attachments are placed in when the caller gives
/// no address.
const SHM_ATTACH_BASE: u64 = 0x7000_0000;

struct ShmSegment {
    in_use: bool,
    key: i32,
    size: u64,
    npages: usize,
    perms: u32,
    uid: u32,
    gid: u32,
    cpid: u32,
    nattch: u32,
    rmid: bool,
    frames: [PhysAddr; SHM_MAX_PAGES],
}

impl ShmSegment {
    const fn empty() -> Self {
        Self {
            in_use: false,
            key: 0,
            size: 0,
            npages: 0,
            perms: 0,
            uid: 0,
            gid: 0,
            cpid: 0,
            nattch: 0,
            rmid: false,
            frames: [PhysAddr::NULL; SHM_MAX_PAGES],
        }
    }
}

static SEGMENTS: IrqMutex<[ShmSegment; SHMMNI]> =
    IrqMutex::new([const { ShmSegment::empty() }; SHMMNI]);

fn destroy_locked(seg: &mut ShmSegment) {
    for frame in seg.frames.iter().take(seg.npages) {
        if !frame.is_null() {
            free_page_frame(*frame);
        }
    }
    *seg = ShmSegment::empty();
}

/// shmget(2): find or create a segment for `key`.
pub fn shmget(task: *mut Task, key: i32, size: u64, shmflg: u32) -> KResult<i32> {
    if size == 0 || size > (SHM_MAX_PAGES as u64) * PAGE_SIZE {
        return Err(Errno::EINVAL);
    }
    let t = unsafe { &*task };
    let mut segs = SEGMENTS.lock();

    if key != IPC_PRIVATE {
        for (id, seg) in segs.iter().enumerate() {
            if seg.in_use && seg.key == key && !seg.rmid {
                if shmflg & (IPC_CREAT | IPC_EXCL) == (IPC_CREAT | IPC_EXCL) {
                    return Err(Errno::EEXIST);
                }
                if size > seg.size {
                    return Err(Errno::EINVAL);
                }
                return Ok(id as i32);
            }
        }
        if shmflg & IPC_CREAT == 0 {
            return Err(Errno::ENOENT);
        }
    }

    let npages = size.div_ceil(PAGE_SIZE) as usize;
    for (id, seg) in segs.iter_mut().enumerate() {
        if seg.in_use {
            continue;
        }
        *seg = ShmSegment::empty();
        seg.in_use = true;
        seg.key = key;
        seg.size = size;
        seg.npages = npages;
        seg.perms = shmflg & 0o777;
        seg.uid = t.euid;
        seg.gid = t.egid;
        seg.cpid = t.pid;
        // Frames are allocated up front; the segment owns one share of
        // each until destruction.
        for i in 0..npages {
            let frame = alloc_page_frame(ALLOC_FLAG_ZERO);
            if frame.is_null() {
                destroy_locked(seg);
                return Err(Errno::ENOMEM);
            }
            seg.frames[i] = frame;
        }
        klog_info!("shm: created segment {} ({} pages)", id, npages);
        return Ok(id as i32);
    }
    Err(Errno::ENOSPC)
}

/// shmat(2): map the segment into the calling task at `hint` (or the
/// first hole in the attach window), as a SHMEM shared region.
pub fn shmat(task: *mut Task, id: i32, hint: u64) -> KResult<u64> {
    let (npages, frames) = {
        let segs = SEGMENTS.lock();
        let seg = segs
            .get(id as usize)
            .filter(|s| s.in_use)
            .ok_or(Errno::EINVAL)?;
        (seg.npages, seg.frames)
    };

    let bytes = npages as u64 * PAGE_SIZE;
    let addr = if hint != 0 {
        if hint % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        hint
    } else {
        let mut candidate = SHM_ATTACH_BASE;
        while memregion_check_overlaps(task, candidate, candidate + bytes).is_err() {
            candidate += bytes.max(PAGE_SIZE);
            if candidate + bytes > cinder_mm::mm_constants::USER_MEM_END {
                return Err(Errno::ENOMEM);
            }
        }
        candidate
    };

    memregion_alloc_and_attach(
        task,
        core::ptr::null_mut(),
        0,
        0,
        addr,
        addr + bytes,
        PROT_READ | PROT_WRITE,
        MEMREGION_TYPE_SHMEM,
        MEMREGION_FLAG_SHARED | MEMREGION_FLAG_USER,
        false,
    )?;

    // Map the segment's frames; every mapping takes a share.
    let pd = unsafe { (*(*task).mem).page_dir };
    for (i, frame) in frames.iter().take(npages).enumerate() {
        inc_frame_shares(*frame);
        if map_page_in_dir(
            pd,
            VirtAddr::new(addr + i as u64 * PAGE_SIZE),
            *frame,
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
        ) != 0
        {
            free_page_frame(*frame);
            return Err(Errno::ENOMEM);
        }
    }

    let mut segs = SEGMENTS.lock();
    segs[id as usize].nattch += 1;
    Ok(addr)
}

/// shmdt(2): detach the segment mapped at `addr`. The region teardown
/// reports back through `shm_region_detached`.
pub fn shmdt(task: *mut Task, addr: u64) -> KResult<()> {
    let region = memregion_containing(task, addr);
    if region.is_null() {
        return Err(Errno::EINVAL);
    }
    let r = unsafe { &*region };
    if r.rtype != MEMREGION_TYPE_SHMEM || r.addr != addr {
        return Err(Errno::EINVAL);
    }
    memregion_detach(task, region, true)
}

/// A SHMEM region went away; account the detachment by the frame of its
/// first page and destroy removal-marked segments on the last one.
pub fn shm_region_detached(first_frame: PhysAddr) {
    if first_frame.is_null() {
        return;
    }
    let mut segs = SEGMENTS.lock();
    for (id, seg) in segs.iter_mut().enumerate() {
        if seg.in_use && seg.npages > 0 && seg.frames[0] == first_frame {
            seg.nattch = seg.nattch.saturating_sub(1);
            if seg.rmid && seg.nattch == 0 {
                klog_info!("shm: destroying removed segment {}", id);
                destroy_locked(seg);
            }
            return;
        }
    }
}

/// Fork re-registers the child's inherited attachment.
pub fn shm_region_attached(first_frame: PhysAddr) {
    if first_frame.is_null() {
        return;
    }
    let mut segs = SEGMENTS.lock();
    for seg in segs.iter_mut() {
        if seg.in_use && seg.npages > 0 && seg.frames[0] == first_frame {
            seg.nattch += 1;
            return;
        }
    }
}

/// shmctl(2): IPC_STAT / IPC_SET / IPC_RMID.
pub fn shmctl(task: *mut Task, id: i32, cmd: u32, buf: Option<&mut ShmidDs>) -> KResult<()> {
    let t = unsafe { &*task };
    let mut segs = SEGMENTS.lock();
    let seg = segs
        .get_mut(id as usize)
        .filter(|s| s.in_use)
        .ok_or(Errno::EINVAL)?;

    match cmd {
        cinder_abi::ipc::IPC_STAT => {
            let Some(buf) = buf else {
                return Err(Errno::EFAULT);
            };
            *buf = ShmidDs {
                shm_perm_uid: seg.uid,
                shm_perm_gid: seg.gid,
                shm_perm_mode: seg.perms,
                shm_segsz: seg.size,
                shm_nattch: seg.nattch as u64,
                shm_cpid: seg.cpid,
                shm_lpid: t.pid,
            };
            Ok(())
        }
        cinder_abi::ipc::IPC_SET => {
            let Some(buf) = buf else {
                return Err(Errno::EFAULT);
            };
            if t.euid != 0 && t.euid != seg.uid {
                return Err(Errno::EPERM);
            }
            seg.uid = buf.shm_perm_uid;
            seg.gid = buf.shm_perm_gid;
            seg.perms = buf.shm_perm_mode & 0o777;
            Ok(())
        }
        cinder_abi::ipc::IPC_RMID => {
            if t.euid != 0 && t.euid != seg.uid {
                return Err(Errno::EPERM);
            }
            seg.rmid = true;
            if seg.nattch == 0 {
                destroy_locked(seg);
            }
            Ok(())
        }
        _ => Err(Errno::EINVAL),
    }
}
