//! Block-device contract and the RAM disk.
//!
//! Drivers register per major number with a `strategy` entry point; the page
//! cache issues every disk transfer through it and nothing else. A request
//! carries the device id, a block number, a byte count and a kernel buffer;
//! drivers report failure with a negative errno-style return.
//!
//! The RAM disk driver at `RAMDISK_MAJOR` is the one block device the
//! substrate ships: minors are heap-backed byte arrays, which is what the
//! kernel formats and mounts as the root filesystem (and what the tests
//! run against).

use core::ptr;

use cinder_abi::errno::Errno;
use cinder_abi::fs::{DevId, major, minor};
use cinder_lib::{IrqMutex, klog_info};
use cinder_mm::{kfree, kmalloc_zeroed};

/// One read or write of one or more consecutive blocks.
pub struct DiskReq {
    pub dev: DevId,
    /// Kernel buffer the transfer reads from / writes into.
    pub data: *mut u8,
    /// Transfer size in bytes (a multiple of `fs_blocksz`).
    pub datasz: usize,
    /// The filesystem's logical block size.
    pub fs_blocksz: usize,
    /// First block number of the transfer.
    pub blockno: u64,
    pub write: bool,
}

/// Driver entry point. Returns bytes transferred or a negative errno.
pub type StrategyFn = fn(&mut DiskReq) -> i64;

#[derive(Clone, Copy)]
pub struct BlockDevOps {
    pub strategy: Option<StrategyFn>,
}

impl BlockDevOps {
    const fn empty() -> Self {
        Self { strategy: None }
    }
}

pub const NR_BDEV: usize = 64;

static BDEV_TAB: IrqMutex<[BlockDevOps; NR_BDEV]> =
    IrqMutex::new([BlockDevOps::empty(); NR_BDEV]);

/// Register a driver for a major number.
pub fn bdev_register(maj: u32, ops: BlockDevOps) -> Result<(), Errno> {
    if maj as usize >= NR_BDEV {
        return Err(Errno::EINVAL);
    }
    let mut tab = BDEV_TAB.lock();
    tab[maj as usize] = ops;
    Ok(())
}

/// Issue one strategy call to the driver owning `req.dev`.
pub fn bdev_strategy(req: &mut DiskReq) -> i64 {
    let maj = major(req.dev) as usize;
    let strategy = {
        let tab = BDEV_TAB.lock();
        if maj >= NR_BDEV {
            None
        } else {
            tab[maj].strategy
        }
    };
    match strategy {
        Some(f) => f(req),
        None => Errno::ENODEV.as_neg(),
    }
}

// ---------------------------------------------------------------------------
// RAM disk
// ---------------------------------------------------------------------------

pub const RAMDISK_MAJOR: u32 = 240;
pub const NR_RAMDISK: usize = 8;

struct RamDisk {
    data: *mut u8,
    size: usize,
    block_size: usize,
}

unsafe impl Send for RamDisk {}

impl RamDisk {
    const fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            size: 0,
            block_size: 0,
        }
    }
}

static RAMDISKS: IrqMutex<[RamDisk; NR_RAMDISK]> =
    IrqMutex::new([const { RamDisk::empty() }; NR_RAMDISK]);

fn ramdisk_strategy(req: &mut DiskReq) -> i64 {
    let min = minor(req.dev) as usize;
    let disks = RAMDISKS.lock();
    if min >= NR_RAMDISK || disks[min].data.is_null() {
        return Errno::ENODEV.as_neg();
    }
    let disk = &disks[min];
    let off = req.blockno as usize * disk.block_size;
    if off + req.datasz > disk.size {
        return Errno::EIO.as_neg();
    }
    // SAFETY: the bounds check above keeps the transfer inside the disk's
    // backing allocation; `req.data` is a kernel buffer of `datasz` bytes.
    unsafe {
        if req.write {
            ptr::copy_nonoverlapping(req.data, disk.data.add(off), req.datasz);
        } else {
            ptr::copy_nonoverlapping(disk.data.add(off), req.data, req.datasz);
        }
    }
    req.datasz as i64
}

/// Create (or recreate) a RAM disk at the given minor.
pub fn ramdisk_create(min: u32, nblocks: u64, block_size: usize) -> Result<(), Errno> {
    if min as usize >= NR_RAMDISK || block_size == 0 {
        return Err(Errno::EINVAL);
    }
    let size = nblocks as usize * block_size;
    let data = kmalloc_zeroed(size);
    if data.is_null() {
        return Err(Errno::ENOMEM);
    }

    let mut disks = RAMDISKS.lock();
    let disk = &mut disks[min as usize];
    if !disk.data.is_null() {
        kfree(disk.data);
    }
    disk.data = data;
    disk.size = size;
    disk.block_size = block_size;
    klog_info!(
        "ramdisk: created minor {} ({} blocks of {} bytes)",
        min,
        nblocks,
        block_size
    );
    Ok(())
}

pub fn ramdisk_destroy(min: u32) {
    if min as usize >= NR_RAMDISK {
        return;
    }
    let mut disks = RAMDISKS.lock();
    let disk = &mut disks[min as usize];
    if !disk.data.is_null() {
        kfree(disk.data);
        disk.data = ptr::null_mut();
        disk.size = 0;
    }
}

/// Register the RAM disk driver. Idempotent.
pub fn ramdisk_init() {
    let _ = bdev_register(
        RAMDISK_MAJOR,
        BlockDevOps {
            strategy: Some(ramdisk_strategy),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_abi::fs::to_devid;

    #[test]
    fn test_ramdisk_roundtrip() {
        ramdisk_init();
        ramdisk_create(7, 16, 512).unwrap();
        let dev = to_devid(RAMDISK_MAJOR, 7);

        let mut buf = [0xAAu8; 1024];
        let mut req = DiskReq {
            dev,
            data: buf.as_mut_ptr(),
            datasz: 1024,
            fs_blocksz: 512,
            blockno: 2,
            write: true,
        };
        assert_eq!(bdev_strategy(&mut req), 1024);

        let mut back = [0u8; 1024];
        let mut req = DiskReq {
            dev,
            data: back.as_mut_ptr(),
            datasz: 1024,
            fs_blocksz: 512,
            blockno: 2,
            write: false,
        };
        assert_eq!(bdev_strategy(&mut req), 1024);
        assert_eq!(buf, back);
        ramdisk_destroy(7);
    }

    #[test]
    fn test_out_of_range_is_eio() {
        ramdisk_init();
        ramdisk_create(6, 4, 512).unwrap();
        let dev = to_devid(RAMDISK_MAJOR, 6);
        let mut buf = [0u8; 512];
        let mut req = DiskReq {
            dev,
            data: buf.as_mut_ptr(),
            datasz: 512,
            fs_blocksz: 512,
            blockno: 99,
            write: false,
        };
        assert!(bdev_strategy(&mut req) < 0);
        ramdisk_destroy(6);
    }
}
