//! memfs: the substrate's reference filesystem.
//!
//! A block-device filesystem with the classic small-Unix layout: a
//! superblock in block 0, a block bitmap, a fixed inode table, then data
//! blocks. Inodes carry the 15-slot pointer array (12 direct plus an
//! indirect block; the remaining slots are reserved). All access goes
//! through the page cache — file data as file-backed pages, metadata as
//! raw block pages — so memfs doubles as the vtable's reference
//! implementation and the filesystem the kernel boots on.

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{
    DT_UNKNOWN, DevId, FsStatfs, FsUstat, InodeId, NAME_MAX, S_IFDIR, UserDirent, mode_to_dtype,
};
use cinder_lib::klog_info;
use cinder_mm::{kfree, kmalloc_zeroed};

use crate::blockdev::{DiskReq, bdev_strategy};
use crate::fsops::{BmapFlag, DirentLoc, FsOps, fs_register};
use crate::mount::{FS_SUPER_DIRTY, MountInfo, get_mount_info};
use crate::node::{FS_NODE_DIRTY, Node, get_node};
use crate::pcache::{
    CachedPage, get_cached_block, get_cached_page, mark_cached_page_dirty, release_cached_page,
    sync_cached_page,
};

pub const MEMFS_MAGIC: u32 = 0x4D45_4D46;

const DISK_INODE_SIZE: usize = 128;
const DIRENT_SIZE: usize = 64;
const DIRENT_NAME_MAX: usize = 60;
const DIRECT_BLOCKS: usize = 12;
const INDIRECT_SLOT: usize = 12;

pub const MEMFS_ROOT_INO: InodeId = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct SuperBlock {
    magic: u32,
    block_size: u32,
    nblocks: u32,
    ninodes: u32,
    bitmap_start: u32,
    nbitmap: u32,
    itable_start: u32,
    nitable: u32,
    data_start: u32,
    free_blocks: u32,
    free_inodes: u32,
    root_ino: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DiskInode {
    mode: u32,
    links: u32,
    uid: u32,
    gid: u32,
    size: u64,
    atime: u64,
    mtime: u64,
    ctime: u64,
    blocks: [u32; 15],
    _pad: [u8; 20],
}

const _: () = assert!(core::mem::size_of::<DiskInode>() == DISK_INODE_SIZE);

#[repr(C)]
#[derive(Clone, Copy)]
struct DiskDirent {
    ino: u32,
    name: [u8; DIRENT_NAME_MAX],
}

const _: () = assert!(core::mem::size_of::<DiskDirent>() == DIRENT_SIZE);

pub struct MemFs;

static MEMFS: MemFs = MemFs;

/// Register memfs with the VFS. Idempotent.
pub fn memfs_init() {
    let _ = fs_register(b"memfs", &MEMFS);
}

// ---------------------------------------------------------------------------
// Superblock and bitmap plumbing (raw page-cache blocks)
// ---------------------------------------------------------------------------

/// Run `f` against the cached superblock, marking the block dirty when `f`
/// says it changed something.
fn with_super<R>(dev: DevId, f: impl FnOnce(&mut SuperBlock) -> (R, bool)) -> KResult<R> {
    let page = get_cached_block(dev, 0, 0);
    if page.is_null() {
        return Err(Errno::EIO);
    }
    let sb = unsafe { &mut *((*page).virt as *mut SuperBlock) };
    if sb.magic != MEMFS_MAGIC {
        release_cached_page(page);
        return Err(Errno::EINVAL);
    }
    let (res, dirty) = f(sb);
    if dirty {
        mark_cached_page_dirty(page);
        let minfo = get_mount_info(dev);
        if !minfo.is_null() {
            unsafe { (*minfo).flags |= FS_SUPER_DIRTY };
        }
    }
    release_cached_page(page);
    Ok(res)
}

/// Set or clear one bitmap bit; returns the previous value.
fn bitmap_update(dev: DevId, sb_bitmap_start: u32, bsz: usize, block: u64, set: bool) -> KResult<bool> {
    let bits_per_block = (bsz * 8) as u64;
    let bm_block = sb_bitmap_start as u64 + block / bits_per_block;
    let bit = block % bits_per_block;

    let page = get_cached_block(dev, bm_block, 0);
    if page.is_null() {
        return Err(Errno::EIO);
    }
    let byte = unsafe { (*page).virt.add((bit / 8) as usize) };
    let mask = 1u8 << (bit % 8);
    let old = unsafe { *byte } & mask != 0;
    unsafe {
        if set {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
    mark_cached_page_dirty(page);
    release_cached_page(page);
    Ok(old)
}

/// Allocate one data block, preferring the mount's incore free cache and
/// refilling it from the bitmap when empty.
fn balloc(dev: DevId) -> u64 {
    let minfo = get_mount_info(dev);
    if minfo.is_null() {
        return 0;
    }
    let m = unsafe { &mut *minfo };
    let _g = m.flock.guard();

    if m.nfree > 0 {
        m.nfree -= 1;
        let block = m.free[m.nfree];
        let layout = match with_super(dev, |sb| ((sb.bitmap_start, sb.free_blocks), false)) {
            Ok(l) => l,
            Err(_) => return 0,
        };
        if layout.1 == 0 {
            return 0;
        }
        if bitmap_update(dev, layout.0, m.block_size, block, true) == Ok(false) {
            let _ = with_super(dev, |sb| {
                sb.free_blocks -= 1;
                ((), true)
            });
            return block;
        }
        // Raced: the cached hint was taken; fall through to a scan.
    }

    // Refill the cache with a bitmap scan and take the first hit.
    let scan = with_super(dev, |sb| {
        ((sb.bitmap_start, sb.data_start as u64, sb.nblocks as u64, sb.free_blocks), false)
    });
    let (bitmap_start, data_start, nblocks, free_blocks) = match scan {
        Ok(v) => v,
        Err(_) => return 0,
    };
    if free_blocks == 0 {
        return 0;
    }

    let mut claimed = 0u64;
    for b in data_start..nblocks {
        match bitmap_update(dev, bitmap_start, m.block_size, b, true) {
            Ok(false) => {
                claimed = b;
                break;
            }
            Ok(true) => {
                // In use: undo nothing, keep scanning.
            }
            Err(_) => return 0,
        }
    }
    if claimed == 0 {
        return 0;
    }
    let _ = with_super(dev, |sb| {
        sb.free_blocks -= 1;
        ((), true)
    });
    claimed
}

/// Release one data block back to the bitmap and the incore cache.
fn bfree(dev: DevId, block: u64) {
    if block == 0 {
        return;
    }
    let minfo = get_mount_info(dev);
    if minfo.is_null() {
        return;
    }
    let m = unsafe { &mut *minfo };
    let _g = m.flock.guard();

    let bitmap_start = match with_super(dev, |sb| (sb.bitmap_start, false)) {
        Ok(v) => v,
        Err(_) => return,
    };
    if bitmap_update(dev, bitmap_start, m.block_size, block, false) == Ok(true) {
        let _ = with_super(dev, |sb| {
            sb.free_blocks += 1;
            ((), true)
        });
        if m.nfree < crate::mount::NR_FREE_CACHE {
            m.free[m.nfree] = block;
            m.nfree += 1;
        }
    }
}

/// Zero a freshly-allocated block so stale data never leaks into files.
fn zero_block(dev: DevId, block: u64) {
    let page = get_cached_block(dev, block, 0);
    if page.is_null() {
        return;
    }
    unsafe { core::ptr::write_bytes((*page).virt, 0, (*page).len) };
    mark_cached_page_dirty(page);
    release_cached_page(page);
}

// ---------------------------------------------------------------------------
// Inode table plumbing
// ---------------------------------------------------------------------------

struct InodeSlot {
    page: *mut CachedPage,
    dinode: *mut DiskInode,
}

fn inode_slot(dev: DevId, ino: InodeId) -> KResult<InodeSlot> {
    let (itable_start, ninodes, bsz) = with_super(dev, |sb| {
        ((sb.itable_start as u64, sb.ninodes as u64, sb.block_size as usize), false)
    })?;
    if ino == 0 || ino > ninodes {
        return Err(Errno::EINVAL);
    }

    let index = (ino - 1) as usize * DISK_INODE_SIZE;
    let block = itable_start + (index / bsz) as u64;
    let off = index % bsz;

    let page = get_cached_block(dev, block, 0);
    if page.is_null() {
        return Err(Errno::EIO);
    }
    let dinode = unsafe { (*page).virt.add(off) as *mut DiskInode };
    Ok(InodeSlot { page, dinode })
}

// ---------------------------------------------------------------------------
// Directory content access
// ---------------------------------------------------------------------------

/// Visit each dirent of `dir`. The callback gets the dirent, the page it
/// lives in, and its in-page offset; returning `Some(r)` stops the walk
/// with the page still held.
fn scan_dir<R>(
    dir: *mut Node,
    mut f: impl FnMut(&mut DiskDirent, *mut CachedPage, usize) -> Option<R>,
) -> KResult<Option<R>> {
    let size = unsafe { (*dir).size };
    let mut off = 0u64;

    while off < size {
        let page = get_cached_page(dir, off, 0);
        if page.is_null() {
            return Err(Errno::EIO);
        }
        let page_base = off & !(cinder_abi::addr::PAGE_SIZE - 1);
        let page_len = unsafe { (*page).len } as u64;
        let mut in_page = off - page_base;

        while in_page < page_len && page_base + in_page < size {
            let slot_off = in_page as usize;
            let de = unsafe { &mut *((*page).virt.add(slot_off) as *mut DiskDirent) };
            if let Some(r) = f(de, page, slot_off) {
                return Ok(Some(r));
            }
            in_page += DIRENT_SIZE as u64;
        }
        release_cached_page(page);
        off = page_base + page_len;
    }
    Ok(None)
}

fn dirent_to_loc(de: &DiskDirent, page: *mut CachedPage, offset: usize) -> DirentLoc {
    let mut name = [0u8; NAME_MAX];
    let len = de
        .name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(DIRENT_NAME_MAX)
        .min(NAME_MAX);
    name[..len].copy_from_slice(&de.name[..len]);
    DirentLoc {
        ino: de.ino as InodeId,
        name_len: len,
        name,
        page,
        offset,
    }
}

// ---------------------------------------------------------------------------
// FsOps implementation
// ---------------------------------------------------------------------------

impl FsOps for MemFs {
    fn read_inode(&self, node: *mut Node) -> KResult<()> {
        let n = unsafe { &mut *node };
        let slot = inode_slot(n.dev, n.inode)?;
        let d = unsafe { &*slot.dinode };
        if d.mode == 0 {
            release_cached_page(slot.page);
            return Err(Errno::ENOENT);
        }
        n.mode = d.mode;
        n.links = d.links;
        n.uid = d.uid;
        n.gid = d.gid;
        n.size = d.size;
        n.atime = d.atime;
        n.mtime = d.mtime;
        n.ctime = d.ctime;
        for (dst, src) in n.blocks.iter_mut().zip(d.blocks.iter()) {
            *dst = *src as u64;
        }
        release_cached_page(slot.page);
        Ok(())
    }

    fn write_inode(&self, node: *mut Node) -> KResult<()> {
        let n = unsafe { &*node };
        let slot = inode_slot(n.dev, n.inode)?;
        let d = unsafe { &mut *slot.dinode };
        d.mode = n.mode;
        d.links = n.links;
        d.uid = n.uid;
        d.gid = n.gid;
        d.size = n.size;
        d.atime = n.atime;
        d.mtime = n.mtime;
        d.ctime = n.ctime;
        for (dst, src) in d.blocks.iter_mut().zip(n.blocks.iter()) {
            *dst = *src as u32;
        }
        mark_cached_page_dirty(slot.page);
        release_cached_page(slot.page);
        Ok(())
    }

    fn alloc_inode(&self, node: *mut Node) -> KResult<()> {
        let n = unsafe { &mut *node };
        let minfo = get_mount_info(n.dev);
        if minfo.is_null() {
            return Err(Errno::ENODEV);
        }
        let _g = unsafe { (*minfo).ilock.guard() };

        let ninodes = with_super(n.dev, |sb| (sb.ninodes as u64, false))?;
        for ino in 1..=ninodes {
            let slot = inode_slot(n.dev, ino)?;
            let d = unsafe { &mut *slot.dinode };
            if d.mode == 0 {
                // Claim it with a placeholder mode; write_inode fills in
                // the real one.
                d.mode = 0x8000_0000;
                mark_cached_page_dirty(slot.page);
                release_cached_page(slot.page);
                n.inode = ino;
                let _ = with_super(n.dev, |sb| {
                    sb.free_inodes = sb.free_inodes.saturating_sub(1);
                    ((), true)
                });
                return Ok(());
            }
            release_cached_page(slot.page);
        }
        Err(Errno::ENOSPC)
    }

    fn free_inode(&self, node: *mut Node) -> KResult<()> {
        let n = unsafe { &*node };
        let slot = inode_slot(n.dev, n.inode)?;
        unsafe { *slot.dinode = core::mem::zeroed() };
        mark_cached_page_dirty(slot.page);
        release_cached_page(slot.page);
        let _ = with_super(n.dev, |sb| {
            sb.free_inodes += 1;
            ((), true)
        });
        Ok(())
    }

    fn bmap(&self, node: *mut Node, lblock: u64, block_size: usize, flag: BmapFlag) -> u64 {
        let n = unsafe { &mut *node };
        let per_ind = (block_size / 4) as u64;

        if lblock < DIRECT_BLOCKS as u64 {
            let i = lblock as usize;
            let cur = n.blocks[i];
            return match flag {
                BmapFlag::None => cur,
                BmapFlag::Create => {
                    if cur != 0 {
                        cur
                    } else {
                        let b = balloc(n.dev);
                        if b != 0 {
                            zero_block(n.dev, b);
                            n.blocks[i] = b;
                            n.set_flag(FS_NODE_DIRTY);
                        }
                        b
                    }
                }
                BmapFlag::Free => {
                    if cur != 0 {
                        bfree(n.dev, cur);
                        n.blocks[i] = 0;
                        n.set_flag(FS_NODE_DIRTY);
                    }
                    0
                }
            };
        }

        let i = lblock - DIRECT_BLOCKS as u64;
        if i >= per_ind {
            return 0;
        }

        let mut ind = n.blocks[INDIRECT_SLOT];
        if ind == 0 {
            if !matches!(flag, BmapFlag::Create) {
                return 0;
            }
            ind = balloc(n.dev);
            if ind == 0 {
                return 0;
            }
            zero_block(n.dev, ind);
            n.blocks[INDIRECT_SLOT] = ind;
            n.set_flag(FS_NODE_DIRTY);
        }

        let page = get_cached_block(n.dev, ind, 0);
        if page.is_null() {
            return 0;
        }
        let slot = unsafe { ((*page).virt as *mut u32).add(i as usize) };
        let cur = unsafe { *slot } as u64;
        let res = match flag {
            BmapFlag::None => cur,
            BmapFlag::Create => {
                if cur != 0 {
                    cur
                } else {
                    let b = balloc(n.dev);
                    if b != 0 {
                        zero_block(n.dev, b);
                        unsafe { *slot = b as u32 };
                        mark_cached_page_dirty(page);
                    }
                    b
                }
            }
            BmapFlag::Free => {
                if cur != 0 {
                    bfree(n.dev, cur);
                    unsafe { *slot = 0 };
                    mark_cached_page_dirty(page);
                }
                // A fully-drained indirect block goes back to the bitmap.
                let entries = unsafe {
                    core::slice::from_raw_parts((*page).virt as *const u32, per_ind as usize)
                };
                if entries.iter().all(|&e| e == 0) {
                    n.blocks[INDIRECT_SLOT] = 0;
                    n.set_flag(FS_NODE_DIRTY);
                    release_cached_page(page);
                    bfree(n.dev, ind);
                    return 0;
                }
                0
            }
        };
        release_cached_page(page);
        res
    }

    fn read_symlink(&self, node: *mut Node, buf: &mut [u8]) -> KResult<usize> {
        let n = unsafe { &*node };
        let block = n.blocks[0];
        if block == 0 || n.size == 0 {
            return Ok(0);
        }
        let page = get_cached_block(n.dev, block, 0);
        if page.is_null() {
            return Err(Errno::EIO);
        }
        let len = core::cmp::min(buf.len() as u64, n.size) as usize;
        unsafe { core::ptr::copy_nonoverlapping((*page).virt, buf.as_mut_ptr(), len) };
        release_cached_page(page);
        Ok(len)
    }

    fn write_symlink(&self, node: *mut Node, target: &[u8]) -> KResult<usize> {
        let n = unsafe { &mut *node };
        let minfo = get_mount_info(n.dev);
        if minfo.is_null() {
            return Err(Errno::ENODEV);
        }
        if target.len() > unsafe { (*minfo).block_size } {
            return Err(Errno::ENAMETOOLONG);
        }

        let mut block = n.blocks[0];
        if block == 0 {
            block = balloc(n.dev);
            if block == 0 {
                return Err(Errno::ENOSPC);
            }
            zero_block(n.dev, block);
            n.blocks[0] = block;
        }
        let page = get_cached_block(n.dev, block, 0);
        if page.is_null() {
            return Err(Errno::EIO);
        }
        unsafe { core::ptr::copy_nonoverlapping(target.as_ptr(), (*page).virt, target.len()) };
        mark_cached_page_dirty(page);
        release_cached_page(page);

        n.size = target.len() as u64;
        n.set_flag(FS_NODE_DIRTY);
        Ok(target.len())
    }

    fn finddir(&self, dir: *mut Node, name: &[u8]) -> KResult<DirentLoc> {
        if name.is_empty() || name.len() > DIRENT_NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        let hit = scan_dir(dir, |de, page, off| {
            if de.ino == 0 {
                return None;
            }
            let len = de
                .name
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(DIRENT_NAME_MAX);
            if &de.name[..len] == name {
                Some(dirent_to_loc(de, page, off))
            } else {
                None
            }
        })?;
        hit.ok_or(Errno::ENOENT)
    }

    fn finddir_by_inode(&self, dir: *mut Node, node: *mut Node) -> KResult<DirentLoc> {
        let target = unsafe { (*node).inode } as u32;
        let hit = scan_dir(dir, |de, page, off| {
            if de.ino == target {
                Some(dirent_to_loc(de, page, off))
            } else {
                None
            }
        })?;
        hit.ok_or(Errno::ENOENT)
    }

    fn addir(&self, dir: *mut Node, name: &[u8], ino: InodeId) -> KResult<()> {
        if name.is_empty() || name.len() > DIRENT_NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }

        // Reuse a hole left by a deleted entry first.
        let reused = scan_dir(dir, |de, page, _off| {
            if de.ino != 0 {
                return None;
            }
            de.ino = ino as u32;
            de.name = [0; DIRENT_NAME_MAX];
            de.name[..name.len()].copy_from_slice(name);
            mark_cached_page_dirty(page);
            Some(page)
        })?;
        if let Some(page) = reused {
            release_cached_page(page);
            return Ok(());
        }

        // Append at the tail, growing the directory by one record.
        let d = unsafe { &mut *dir };
        let off = d.size;
        let page = get_cached_page(dir, off, crate::pcache::PCACHE_AUTO_ALLOC);
        if page.is_null() {
            return Err(Errno::ENOSPC);
        }
        let in_page = (off % cinder_abi::addr::PAGE_SIZE) as usize;
        let de = unsafe { &mut *((*page).virt.add(in_page) as *mut DiskDirent) };
        de.ino = ino as u32;
        de.name = [0; DIRENT_NAME_MAX];
        de.name[..name.len()].copy_from_slice(name);
        mark_cached_page_dirty(page);
        release_cached_page(page);

        d.size += DIRENT_SIZE as u64;
        d.set_flag(FS_NODE_DIRTY);
        Ok(())
    }

    fn mkdir(&self, dir: *mut Node, parent: InodeId) -> KResult<()> {
        let ino = unsafe { (*dir).inode };
        self.addir(dir, b".", ino)?;
        self.addir(dir, b"..", parent)
    }

    fn deldir(&self, dir: *mut Node, loc: &DirentLoc, is_last_dir_link: bool) -> KResult<()> {
        // memfs keeps no separate on-disk directory count, so the rename
        // flag has nothing extra to suppress here.
        let _ = is_last_dir_link;
        let _ = dir;
        if loc.page.is_null() {
            return Err(Errno::EINVAL);
        }
        let de = unsafe { &mut *((*loc.page).virt.add(loc.offset) as *mut DiskDirent) };
        de.ino = 0;
        de.name = [0; DIRENT_NAME_MAX];
        mark_cached_page_dirty(loc.page);
        Ok(())
    }

    fn dir_empty(&self, dir: *mut Node) -> bool {
        let hit = scan_dir(dir, |de, page, _off| {
            if de.ino == 0 {
                return None;
            }
            let len = de
                .name
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(DIRENT_NAME_MAX);
            let name = &de.name[..len];
            if name == b"." || name == b".." {
                None
            } else {
                Some(page)
            }
        });
        match hit {
            Ok(Some(page)) => {
                release_cached_page(page);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    fn getdents(&self, dir: *mut Node, pos: &mut u64, buf: &mut [u8]) -> KResult<usize> {
        let size = unsafe { (*dir).size };
        let dev = unsafe { (*dir).dev };
        let out_rec = core::mem::size_of::<UserDirent>();
        let mut written = 0usize;

        while *pos < size && written + out_rec <= buf.len() {
            let page = get_cached_page(dir, *pos, 0);
            if page.is_null() {
                break;
            }
            let in_page = (*pos % cinder_abi::addr::PAGE_SIZE) as usize;
            let de = unsafe { &*((*page).virt.add(in_page) as *const DiskDirent) };
            let ino = de.ino;
            let mut name = [0u8; DIRENT_NAME_MAX];
            name.copy_from_slice(&de.name);
            release_cached_page(page);

            *pos += DIRENT_SIZE as u64;
            if ino == 0 {
                continue;
            }

            let mut ent = UserDirent::empty();
            ent.d_ino = ino as u64;
            ent.d_off = *pos;
            let len = name
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(DIRENT_NAME_MAX)
                .min(NAME_MAX - 1);
            ent.d_name[..len].copy_from_slice(&name[..len]);
            ent.d_type = match get_node(dev, ino as InodeId, false) {
                Ok(child) => {
                    let t = mode_to_dtype(unsafe { (*child).mode });
                    crate::node::release_node(child);
                    t
                }
                Err(_) => DT_UNKNOWN,
            };

            unsafe {
                core::ptr::copy_nonoverlapping(
                    (&ent as *const UserDirent) as *const u8,
                    buf.as_mut_ptr().add(written),
                    out_rec,
                );
            }
            written += out_rec;
        }
        Ok(written)
    }

    fn read_super(&self, dev: DevId, minfo: *mut MountInfo) -> KResult<()> {
        // The superblock's first 512 bytes are read straight through the
        // driver: the block size is not known until they are parsed.
        let mut raw = [0u8; 512];
        let mut req = DiskReq {
            dev,
            data: raw.as_mut_ptr(),
            datasz: 512,
            fs_blocksz: 512,
            blockno: 0,
            write: false,
        };
        if bdev_strategy(&mut req) < 0 {
            return Err(Errno::EIO);
        }
        let sb = unsafe { &*(raw.as_ptr() as *const SuperBlock) };
        if sb.magic != MEMFS_MAGIC || sb.block_size == 0 {
            return Err(Errno::EINVAL);
        }

        unsafe {
            (*minfo).block_size = sb.block_size as usize;
        }

        let root = get_node(dev, sb.root_ino as InodeId, false)?;
        unsafe {
            (*minfo).root = root;
        }
        klog_info!(
            "memfs: superblock on dev {:#x}: {} blocks, {} inodes",
            dev,
            sb.nblocks,
            sb.ninodes
        );
        Ok(())
    }

    fn write_super(&self, dev: DevId) -> KResult<()> {
        let page = get_cached_block(dev, 0, 0);
        if page.is_null() {
            return Err(Errno::EIO);
        }
        let res = sync_cached_page(page).map(|_| ());
        release_cached_page(page);
        res
    }

    fn put_super(&self, _dev: DevId) {}

    fn ustat(&self, minfo: *mut MountInfo, buf: &mut FsUstat) -> KResult<()> {
        let dev = unsafe { (*minfo).dev };
        with_super(dev, |sb| {
            (
                {
                    buf.f_tfree = sb.free_blocks as u64;
                    buf.f_tinode = sb.free_inodes as u64;
                },
                false,
            )
        })
    }

    fn statfs(&self, minfo: *mut MountInfo, buf: &mut FsStatfs) -> KResult<()> {
        let dev = unsafe { (*minfo).dev };
        with_super(dev, |sb| {
            (
                {
                    buf.f_type = MEMFS_MAGIC as u64;
                    buf.f_bsize = sb.block_size as u64;
                    buf.f_blocks = sb.nblocks as u64;
                    buf.f_bfree = sb.free_blocks as u64;
                    buf.f_files = sb.ninodes as u64;
                    buf.f_ffree = sb.free_inodes as u64;
                    buf.f_namelen = DIRENT_NAME_MAX as u64;
                },
                false,
            )
        })
    }
}

// ---------------------------------------------------------------------------
// mkfs
// ---------------------------------------------------------------------------

fn write_blocks(dev: DevId, block: u64, data: *mut u8, len: usize, bsz: usize) -> KResult<()> {
    let mut req = DiskReq {
        dev,
        data,
        datasz: len,
        fs_blocksz: bsz,
        blockno: block,
        write: true,
    };
    if bdev_strategy(&mut req) < 0 {
        return Err(Errno::EIO);
    }
    Ok(())
}

/// Lay a fresh memfs down on an unmounted device: superblock, bitmap,
/// inode table, and a root directory with "." and "..".
pub fn memfs_format(dev: DevId, nblocks: u32, ninodes: u32, block_size: usize) -> KResult<()> {
    if block_size < 512 || block_size as u64 > cinder_abi::addr::PAGE_SIZE || ninodes == 0 {
        return Err(Errno::EINVAL);
    }

    let inodes_per_block = (block_size / DISK_INODE_SIZE) as u32;
    let nitable = ninodes.div_ceil(inodes_per_block);
    let nbitmap = nblocks.div_ceil((block_size * 8) as u32);
    let bitmap_start = 1u32;
    let itable_start = bitmap_start + nbitmap;
    let data_start = itable_start + nitable;
    if data_start + 2 >= nblocks {
        return Err(Errno::EINVAL);
    }

    let root_dir_block = data_start as u64;

    let buf = kmalloc_zeroed(block_size);
    if buf.is_null() {
        return Err(Errno::ENOMEM);
    }

    let res = (|| {
        // Superblock.
        let sb = SuperBlock {
            magic: MEMFS_MAGIC,
            block_size: block_size as u32,
            nblocks,
            ninodes,
            bitmap_start,
            nbitmap,
            itable_start,
            nitable,
            data_start,
            free_blocks: nblocks - data_start - 1,
            free_inodes: ninodes - 1,
            root_ino: MEMFS_ROOT_INO as u32,
        };
        unsafe {
            core::ptr::write_bytes(buf, 0, block_size);
            core::ptr::copy_nonoverlapping(
                (&sb as *const SuperBlock) as *const u8,
                buf,
                core::mem::size_of::<SuperBlock>(),
            );
        }
        write_blocks(dev, 0, buf, block_size, block_size)?;

        // Bitmap: metadata blocks plus the root directory block are taken.
        let used = data_start as u64 + 1;
        for bm in 0..nbitmap {
            unsafe { core::ptr::write_bytes(buf, 0, block_size) };
            let first_bit = bm as u64 * (block_size * 8) as u64;
            for bit in 0..(block_size * 8) as u64 {
                if first_bit + bit >= used {
                    break;
                }
                unsafe { *buf.add((bit / 8) as usize) |= 1 << (bit % 8) };
            }
            write_blocks(dev, (bitmap_start + bm) as u64, buf, block_size, block_size)?;
        }

        // Inode table, with the root inode in place.
        for tb in 0..nitable {
            unsafe { core::ptr::write_bytes(buf, 0, block_size) };
            if tb == 0 {
                let root = DiskInode {
                    mode: S_IFDIR | 0o755,
                    links: 2,
                    uid: 0,
                    gid: 0,
                    size: (2 * DIRENT_SIZE) as u64,
                    atime: 0,
                    mtime: 0,
                    ctime: 0,
                    blocks: {
                        let mut b = [0u32; 15];
                        b[0] = root_dir_block as u32;
                        b
                    },
                    _pad: [0; 20],
                };
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        (&root as *const DiskInode) as *const u8,
                        buf,
                        DISK_INODE_SIZE,
                    );
                }
            }
            write_blocks(dev, (itable_start + tb) as u64, buf, block_size, block_size)?;
        }

        // Root directory content.
        unsafe { core::ptr::write_bytes(buf, 0, block_size) };
        let dot = DiskDirent {
            ino: MEMFS_ROOT_INO as u32,
            name: {
                let mut n = [0u8; DIRENT_NAME_MAX];
                n[0] = b'.';
                n
            },
        };
        let dotdot = DiskDirent {
            ino: MEMFS_ROOT_INO as u32,
            name: {
                let mut n = [0u8; DIRENT_NAME_MAX];
                n[0] = b'.';
                n[1] = b'.';
                n
            },
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                (&dot as *const DiskDirent) as *const u8,
                buf,
                DIRENT_SIZE,
            );
            core::ptr::copy_nonoverlapping(
                (&dotdot as *const DiskDirent) as *const u8,
                buf.add(DIRENT_SIZE),
                DIRENT_SIZE,
            );
        }
        write_blocks(dev, root_dir_block, buf, block_size, block_size)?;
        Ok(())
    })();

    kfree(buf);
    if res.is_ok() {
        klog_info!("memfs: formatted dev {:#x} ({} blocks)", dev, nblocks);
    }
    res
}
