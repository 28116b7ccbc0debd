//! The filesystem operations vtable and the registered-filesystem table.
//!
//! Every concrete filesystem supplies a `FsOps` implementation and registers
//! it by name. The VFS never touches on-disk layout itself: all block
//! translation goes through `bmap`, all directory mutation through
//! `addir`/`deldir`, and so on. Read-only filesystems return `EROFS` from
//! the mutating entries; the VFS treats that as a first-class outcome.

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{DevId, FsStatfs, FsUstat, InodeId};
use cinder_lib::IrqMutex;

use crate::mount::MountInfo;
use crate::node::Node;
use crate::pcache::CachedPage;

/// Mode argument for `bmap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmapFlag {
    /// Translate only; holes return 0.
    None,
    /// Allocate a disk block for a hole.
    Create,
    /// Free the block and clear the pointer.
    Free,
}

/// Where a directory entry lives on disk: the dirent itself plus a borrowed
/// reference to the cached directory page holding it and the byte offset of
/// the record inside that page. The caller rewrites the record in place
/// through the page (rename, unlink) and must release the page afterwards.
pub struct DirentLoc {
    pub ino: InodeId,
    pub name_len: usize,
    pub name: [u8; cinder_abi::fs::NAME_MAX],
    pub page: *mut CachedPage,
    pub offset: usize,
}

impl DirentLoc {
    pub fn name_bytes(&self) -> &[u8] {
        &self.name[..self.name_len]
    }
}

pub trait FsOps: Send + Sync {
    /// Populate the incore node from on-disk state.
    fn read_inode(&self, node: *mut Node) -> KResult<()>;

    /// Flush incore metadata back to disk.
    fn write_inode(&self, node: *mut Node) -> KResult<()>;

    /// Allocate an inode number for a fresh node (fills `node.inode`).
    fn alloc_inode(&self, node: *mut Node) -> KResult<()>;

    /// Release the node's inode number on disk.
    fn free_inode(&self, node: *mut Node) -> KResult<()>;

    /// Map a file's logical block to a disk block. Returns 0 for holes and
    /// on allocation failure. The caller holds the node lock.
    fn bmap(&self, node: *mut Node, lblock: u64, block_size: usize, flag: BmapFlag) -> u64;

    fn read_symlink(&self, node: *mut Node, buf: &mut [u8]) -> KResult<usize>;

    fn write_symlink(&self, node: *mut Node, target: &[u8]) -> KResult<usize>;

    /// Look `name` up in `dir`.
    fn finddir(&self, dir: *mut Node, name: &[u8]) -> KResult<DirentLoc>;

    /// Find the entry pointing at `node` (used by rename bookkeeping).
    fn finddir_by_inode(&self, dir: *mut Node, node: *mut Node) -> KResult<DirentLoc>;

    /// Add an entry to a directory.
    fn addir(&self, dir: *mut Node, name: &[u8], ino: InodeId) -> KResult<()>;

    /// Initialize a fresh directory ("." and "..").
    fn mkdir(&self, dir: *mut Node, parent: InodeId) -> KResult<()>;

    /// Remove a directory entry. `is_last_dir_link` tells the filesystem not
    /// to decrement the on-disk directory link bookkeeping when the caller
    /// is half of a rename rather than a real unlink.
    fn deldir(&self, dir: *mut Node, loc: &DirentLoc, is_last_dir_link: bool) -> KResult<()>;

    fn dir_empty(&self, dir: *mut Node) -> bool;

    /// Serialized dirent iteration from a resumable position.
    fn getdents(&self, dir: *mut Node, pos: &mut u64, buf: &mut [u8]) -> KResult<usize>;

    /// Read the superblock and fill the mount record.
    fn read_super(&self, dev: DevId, minfo: *mut MountInfo) -> KResult<()>;

    fn write_super(&self, dev: DevId) -> KResult<()>;

    fn put_super(&self, dev: DevId);

    fn ustat(&self, minfo: *mut MountInfo, buf: &mut FsUstat) -> KResult<()>;

    fn statfs(&self, minfo: *mut MountInfo, buf: &mut FsStatfs) -> KResult<()>;
}

// ---------------------------------------------------------------------------
// Registered filesystems
// ---------------------------------------------------------------------------

pub const NR_FILESYSTEMS: usize = 16;
pub const FS_NAME_MAX: usize = 8;

#[derive(Clone, Copy)]
pub struct FsInfo {
    pub name: [u8; FS_NAME_MAX],
    pub name_len: usize,
    pub ops: Option<&'static dyn FsOps>,
}

impl FsInfo {
    const fn empty() -> Self {
        Self {
            name: [0; FS_NAME_MAX],
            name_len: 0,
            ops: None,
        }
    }
}

static FSTAB: IrqMutex<[FsInfo; NR_FILESYSTEMS]> =
    IrqMutex::new([const { FsInfo::empty() }; NR_FILESYSTEMS]);

/// Register a filesystem by name. Re-registration replaces the vtable.
pub fn fs_register(name: &[u8], ops: &'static dyn FsOps) -> KResult<()> {
    if name.is_empty() || name.len() > FS_NAME_MAX {
        return Err(Errno::EINVAL);
    }
    let mut tab = FSTAB.lock();
    let mut free = None;
    for (i, info) in tab.iter().enumerate() {
        if info.ops.is_some() {
            if &info.name[..info.name_len] == name {
                free = Some(i);
                break;
            }
        } else if free.is_none() {
            free = Some(i);
        }
    }
    let Some(i) = free else {
        return Err(Errno::ENOSPC);
    };
    tab[i].name[..name.len()].copy_from_slice(name);
    tab[i].name_len = name.len();
    tab[i].ops = Some(ops);
    Ok(())
}

/// Look a filesystem up by name.
pub fn get_fs_by_name(name: &[u8]) -> Option<&'static dyn FsOps> {
    let tab = FSTAB.lock();
    for info in tab.iter() {
        if info.ops.is_some() && &info.name[..info.name_len] == name {
            return info.ops;
        }
    }
    None
}
