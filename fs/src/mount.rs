//! The mount table.
//!
//! One record per mounted device: logical block size, the mounted root and
//! the mount-point inode, the filesystem vtable, mount flags, and the
//! incore free-block/free-inode caches filesystem drivers keep warm between
//! superblock flushes.

use core::ptr;

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{DevId, MS_RDONLY};
use cinder_lib::{IrqMutex, KernelMutex, klog_info};

use crate::fsops::{FsOps, get_fs_by_name};
use crate::node::{
    FS_NODE_MOUNTPOINT, Node, count_device_node_refs, release_node, sync_nodes,
};
use crate::pcache;

pub const NR_SUPER: usize = 8;
pub const NR_FREE_CACHE: usize = 100;

/// Superblock-dirty flag.
pub const FS_SUPER_DIRTY: u32 = 0x01;

#[repr(C)]
pub struct MountInfo {
    pub dev: DevId,
    /// Logical block size of the filesystem; the unit `bmap` talks in.
    pub block_size: usize,
    /// Root inode of the mounted filesystem.
    pub root: *mut Node,
    /// The inode the filesystem is mounted on (null for the system root).
    pub mpoint: *mut Node,
    pub fs_ops: Option<&'static dyn FsOps>,
    pub flags: u32,
    pub mountflags: u32,

    /// Incore free-block cache.
    pub nfree: usize,
    pub free: [u64; NR_FREE_CACHE],
    /// Incore free-inode cache.
    pub ninode: usize,
    pub inode: [u64; NR_FREE_CACHE],
    /// Free-list lock.
    pub flock: KernelMutex,
    /// Inode-list lock.
    pub ilock: KernelMutex,
    pub update_time: u64,

    in_use: bool,
}

unsafe impl Send for MountInfo {}
unsafe impl Sync for MountInfo {}

impl MountInfo {
    const fn empty() -> Self {
        Self {
            dev: 0,
            block_size: 0,
            root: ptr::null_mut(),
            mpoint: ptr::null_mut(),
            fs_ops: None,
            flags: 0,
            mountflags: 0,
            nfree: 0,
            free: [0; NR_FREE_CACHE],
            ninode: 0,
            inode: [0; NR_FREE_CACHE],
            flock: KernelMutex::new(),
            ilock: KernelMutex::new(),
            update_time: 0,
            in_use: false,
        }
    }

    #[inline]
    pub fn readonly(&self) -> bool {
        self.mountflags & MS_RDONLY != 0
    }
}

static mut MOUNT_TAB: [MountInfo; NR_SUPER] = [const { MountInfo::empty() }; NR_SUPER];
static MOUNT_LOCK: IrqMutex<()> = IrqMutex::new(());

static mut SYSTEM_ROOT: *mut Node = ptr::null_mut();

fn tab_slot(i: usize) -> *mut MountInfo {
    // SAFETY: i < NR_SUPER at every call site.
    unsafe { ((&raw mut MOUNT_TAB) as *mut MountInfo).add(i) }
}

/// Find the mount record for a device. Null if not mounted.
pub fn get_mount_info(dev: DevId) -> *mut MountInfo {
    let _g = MOUNT_LOCK.lock();
    for i in 0..NR_SUPER {
        let m = tab_slot(i);
        let r = unsafe { &*m };
        if r.in_use && r.dev == dev {
            return m;
        }
    }
    ptr::null_mut()
}

/// The mount record whose root is `root`, if any (".." traversal).
pub fn mount_by_root(root: *mut Node) -> *mut MountInfo {
    let _g = MOUNT_LOCK.lock();
    for i in 0..NR_SUPER {
        let m = tab_slot(i);
        let r = unsafe { &*m };
        if r.in_use && r.root == root {
            return m;
        }
    }
    ptr::null_mut()
}

/// The system root node (no reference bump).
pub fn system_root() -> *mut Node {
    unsafe { *(&raw const SYSTEM_ROOT) }
}

fn claim_slot(dev: DevId) -> KResult<*mut MountInfo> {
    let _g = MOUNT_LOCK.lock();
    let mut empty: *mut MountInfo = ptr::null_mut();
    for i in 0..NR_SUPER {
        let m = tab_slot(i);
        let r = unsafe { &*m };
        if r.in_use {
            if r.dev == dev {
                return Err(Errno::EBUSY);
            }
        } else if empty.is_null() {
            empty = m;
        }
    }
    if empty.is_null() {
        return Err(Errno::ENFILE);
    }
    let m = unsafe { &mut *empty };
    *m = MountInfo::empty();
    m.dev = dev;
    m.in_use = true;
    Ok(empty)
}

fn drop_slot(minfo: *mut MountInfo) {
    let _g = MOUNT_LOCK.lock();
    unsafe { *minfo = MountInfo::empty() };
}

/// Mount `dev` on the directory node `mpoint` (which must be resolved by
/// the caller without crossing the final mount point). `mpoint` is null
/// for the root mount. Consumes the caller's reference on `mpoint` on
/// success.
pub fn vfs_mount(dev: DevId, mpoint: *mut Node, fstype: &[u8], mountflags: u32) -> KResult<()> {
    let ops = get_fs_by_name(fstype).ok_or(Errno::ENODEV)?;

    if !mpoint.is_null() {
        let mp = unsafe { &*mpoint };
        if !mp.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if mp.has_flag(FS_NODE_MOUNTPOINT) {
            return Err(Errno::EBUSY);
        }
    }

    let minfo = claim_slot(dev)?;
    unsafe {
        (*minfo).fs_ops = Some(ops);
        (*minfo).mountflags = mountflags;
    }

    if let Err(e) = ops.read_super(dev, minfo) {
        drop_slot(minfo);
        return Err(e);
    }

    let root = unsafe { (*minfo).root };
    if root.is_null() {
        drop_slot(minfo);
        return Err(Errno::EIO);
    }

    if mpoint.is_null() {
        unsafe {
            *(&raw mut SYSTEM_ROOT) = root;
        }
        klog_info!("vfs: mounted root device {:#x}", dev);
    } else {
        unsafe {
            let mp = &mut *mpoint;
            mp.set_flag(FS_NODE_MOUNTPOINT);
            mp.ptr = root;
            (*root).ptr = mpoint;
            (*minfo).mpoint = mpoint;
        }
        klog_info!("vfs: mounted device {:#x}", dev);
    }
    Ok(())
}

/// Unmount a device. Fails with `EBUSY` while any node of the device other
/// than its root still carries references.
pub fn vfs_umount(dev: DevId) -> KResult<()> {
    let minfo = get_mount_info(dev);
    if minfo.is_null() {
        return Err(Errno::EINVAL);
    }
    let m = unsafe { &mut *minfo };
    let root = m.root;
    if root == system_root() {
        return Err(Errno::EBUSY);
    }

    if count_device_node_refs(dev, root) > 0
        || unsafe { (*root).refs.load(core::sync::atomic::Ordering::Acquire) } > 1
    {
        return Err(Errno::EBUSY);
    }

    sync_nodes(dev);
    pcache::flush_cached_pages(Some(dev));
    let _ = pcache::remove_cached_disk_pages(dev);

    if let Some(ops) = m.fs_ops {
        let _ = ops.write_super(dev);
        ops.put_super(dev);
    }

    let mpoint = m.mpoint;
    if !mpoint.is_null() {
        unsafe {
            let mp = &mut *mpoint;
            mp.clear_flag(FS_NODE_MOUNTPOINT);
            mp.ptr = ptr::null_mut();
        }
        release_node(mpoint);
    }
    release_node(root);

    drop_slot(minfo);
    klog_info!("vfs: unmounted device {:#x}", dev);
    Ok(())
}

/// Mount the root filesystem. The device must already be formatted.
pub fn vfs_mount_root(dev: DevId, fstype: &[u8]) -> KResult<()> {
    vfs_mount(dev, ptr::null_mut(), fstype, 0)
}

/// Write out dirty superblocks (all devices when `dev == 0`).
pub fn sync_super(dev: DevId) {
    for i in 0..NR_SUPER {
        let m = tab_slot(i);
        let r = unsafe { &mut *m };
        if !r.in_use {
            continue;
        }
        if dev != 0 && r.dev != dev {
            continue;
        }
        if r.flags & FS_SUPER_DIRTY != 0 {
            if let Some(ops) = r.fs_ops {
                if ops.write_super(r.dev).is_ok() {
                    r.flags &= !FS_SUPER_DIRTY;
                }
            }
        }
    }
}

/// Helper for path resolution: the parent used when walking ".." out of a
/// mounted root. Returns the mount point node, or null when `node` is not a
/// mounted root (or is the system root).
pub fn cross_mount_up(node: *mut Node) -> *mut Node {
    if node == system_root() {
        return ptr::null_mut();
    }
    let minfo = mount_by_root(node);
    if minfo.is_null() {
        return ptr::null_mut();
    }
    unsafe { (*minfo).mpoint }
}

/// The periodic housekeeping sweep: dirty superblocks, dirty nodes, then
/// the page-cache flush and age-out. `dev == 0` sweeps everything.
pub fn vfs_update(dev: DevId) {
    sync_super(dev);
    sync_nodes(dev);
    pcache::flush_cached_pages(if dev == 0 { None } else { Some(dev) });
}
