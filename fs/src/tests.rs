//! Filesystem-stack integration tests: memfs on a RAM disk, driven through
//! the public VFS entry points the syscall layer uses.

use std::sync::{Mutex, MutexGuard, Once};

use cinder_abi::errno::Errno;
use cinder_abi::fs::{
    DevId, FsStatfs, FsUstat, InodeId, O_CREAT, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY, S_IFDIR,
    S_IFREG, UserStat, to_devid,
};
use cinder_mm::page_alloc::{dec_frame_shares, get_frame_shares};

use crate::blockdev::{
    BlockDevOps, DiskReq, RAMDISK_MAJOR, bdev_register, ramdisk_create, ramdisk_init,
};
use crate::fileio::{File, closef};
use crate::fsops::{BmapFlag, DirentLoc, FsOps, fs_register};
use crate::memfs::{memfs_format, memfs_init};
use crate::mount::{MountInfo, get_mount_info, vfs_mount, vfs_mount_root};
use crate::node::{Node, get_node, release_node};
use crate::path::{FsContext, vfs_lookup};
use crate::pcache::{
    get_cached_page, release_cached_page, release_cached_page_keep_share,
};
use crate::pipefs::pipe_create;
use crate::vfs::{
    vfs_mkdir, vfs_open, vfs_rename, vfs_stat_node, vfs_symlink, vfs_unlink,
};

const ROOT_DEV: DevId = to_devid(RAMDISK_MAJOR, 0);
const MNT_DEV: DevId = to_devid(RAMDISK_MAJOR, 1);

static FS_LOCK: Mutex<()> = Mutex::new(());
static INIT: Once = Once::new();

fn with_fs() -> MutexGuard<'static, ()> {
    let guard = FS_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    INIT.call_once(|| {
        ramdisk_init();
        memfs_init();
        ramdisk_create(0, 2048, 512).unwrap();
        memfs_format(ROOT_DEV, 2048, 128, 512).unwrap();
        vfs_mount_root(ROOT_DEV, b"memfs").unwrap();
    });
    guard
}

fn ctx() -> FsContext {
    FsContext::kernel()
}

fn open(path: &[u8], flags: u32, mode: u32) -> *mut File {
    vfs_open(&ctx(), path, flags, mode, core::ptr::null_mut()).unwrap()
}

fn read_file(file: *mut File, buf: &mut [u8]) -> usize {
    unsafe {
        let node = (*file).node;
        let read = (*node).read.unwrap();
        let mut pos = (*file).pos;
        let n = read(file, &mut pos, buf).unwrap();
        (*file).pos = pos;
        n
    }
}

fn write_file(file: *mut File, buf: &[u8]) -> usize {
    unsafe {
        let node = (*file).node;
        let write = (*node).write.unwrap();
        let mut pos = (*file).pos;
        let n = write(file, &mut pos, buf).unwrap();
        (*file).pos = pos;
        n
    }
}

fn root_free_blocks() -> u64 {
    let minfo = get_mount_info(ROOT_DEV);
    assert!(!minfo.is_null());
    let mut u = FsUstat::default();
    unsafe {
        (*minfo)
            .fs_ops
            .unwrap()
            .ustat(minfo, &mut u)
            .unwrap();
    }
    u.f_tfree
}

fn stat_path(path: &[u8]) -> Result<UserStat, Errno> {
    let node = vfs_lookup(&ctx(), path, core::ptr::null_mut(), true)?;
    let mut st = UserStat::default();
    vfs_stat_node(node, &mut st);
    release_node(node);
    Ok(st)
}

#[test]
fn test_root_is_directory() {
    let _g = with_fs();
    let st = stat_path(b"/").unwrap();
    assert_eq!(st.st_mode & 0o170000, S_IFDIR);
    assert_eq!(st.st_dev, ROOT_DEV as u64);
}

#[test]
fn test_write_read_roundtrip_across_pages() {
    let _g = with_fs();
    let file = open(b"/roundtrip.bin", O_CREAT | O_RDWR, 0o644);

    // A pattern spanning three pages, deliberately not page-aligned.
    let mut data = vec![0u8; 10_000];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    assert_eq!(write_file(file, &data), data.len());

    unsafe { (*file).pos = 0 };
    let mut back = vec![0u8; data.len()];
    assert_eq!(read_file(file, &mut back), data.len());
    assert_eq!(data, back);

    let st = stat_path(b"/roundtrip.bin").unwrap();
    assert_eq!(st.st_size, data.len() as u64);
    assert_eq!(st.st_mode & 0o170000, S_IFREG);

    closef(file);
    vfs_unlink(&ctx(), b"/roundtrip.bin", false, core::ptr::null_mut()).unwrap();
}

#[test]
fn test_mkdir_rmdir_restores_parent_links() {
    let _g = with_fs();
    let before = stat_path(b"/").unwrap().st_nlink;

    vfs_mkdir(&ctx(), b"/linkdir", 0o755, core::ptr::null_mut()).unwrap();
    assert_eq!(stat_path(b"/").unwrap().st_nlink, before + 1);
    assert_eq!(stat_path(b"/linkdir").unwrap().st_nlink, 2);

    vfs_unlink(&ctx(), b"/linkdir", true, core::ptr::null_mut()).unwrap();
    assert_eq!(stat_path(b"/").unwrap().st_nlink, before);
    assert_eq!(stat_path(b"/linkdir").unwrap_err(), Errno::ENOENT);
}

#[test]
fn test_link_then_unlink_leaves_file_intact() {
    let _g = with_fs();
    let file = open(b"/linked.txt", O_CREAT | O_WRONLY, 0o644);
    assert_eq!(write_file(file, b"payload"), 7);
    closef(file);

    crate::vfs::vfs_link(&ctx(), b"/linked.txt", b"/second-name", true).unwrap();
    assert_eq!(stat_path(b"/linked.txt").unwrap().st_nlink, 2);
    assert_eq!(
        stat_path(b"/second-name").unwrap().st_ino,
        stat_path(b"/linked.txt").unwrap().st_ino
    );

    vfs_unlink(&ctx(), b"/second-name", false, core::ptr::null_mut()).unwrap();
    let st = stat_path(b"/linked.txt").unwrap();
    assert_eq!(st.st_nlink, 1);
    assert_eq!(st.st_size, 7);

    let rd = open(b"/linked.txt", O_RDONLY, 0);
    let mut buf = [0u8; 16];
    assert_eq!(read_file(rd, &mut buf), 7);
    assert_eq!(&buf[..7], b"payload");
    closef(rd);
    vfs_unlink(&ctx(), b"/linked.txt", false, core::ptr::null_mut()).unwrap();
}

#[test]
fn test_unlink_of_open_file_frees_blocks_on_close() {
    let _g = with_fs();
    let free_before = root_free_blocks();

    let file = open(b"/busy.bin", O_CREAT | O_RDWR, 0o644);
    let page = vec![0x5Au8; 4096];
    assert_eq!(write_file(file, &page), 4096);

    vfs_unlink(&ctx(), b"/busy.bin", false, core::ptr::null_mut()).unwrap();
    assert_eq!(stat_path(b"/busy.bin").unwrap_err(), Errno::ENOENT);

    // Still writable while open.
    assert_eq!(write_file(file, &page), 4096);

    closef(file);

    // The last close truncated the orphan and returned its blocks.
    assert_eq!(root_free_blocks(), free_before);
    assert_eq!(stat_path(b"/busy.bin").unwrap_err(), Errno::ENOENT);
}

#[test]
fn test_trailing_slash_on_regular_file() {
    let _g = with_fs();
    let file = open(b"/plain.txt", O_CREAT | O_WRONLY, 0o644);
    closef(file);

    let err = vfs_open(&ctx(), b"/plain.txt/", O_RDONLY, 0, core::ptr::null_mut()).unwrap_err();
    assert_eq!(err, Errno::ENOTDIR);
    vfs_unlink(&ctx(), b"/plain.txt", false, core::ptr::null_mut()).unwrap();
}

#[test]
fn test_symlink_chain_and_loop() {
    let _g = with_fs();
    let file = open(b"/chain-target", O_CREAT | O_WRONLY, 0o644);
    closef(file);

    // A 40-deep chain resolves; the 41st level trips ELOOP.
    vfs_symlink(&ctx(), b"/chain-target", b"/chain-1").unwrap();
    for i in 2..=40 {
        let from = format!("/chain-{}", i).into_bytes();
        let to = format!("/chain-{}", i - 1).into_bytes();
        vfs_symlink(&ctx(), &to, &from).unwrap();
    }
    assert!(stat_path(b"/chain-40").is_ok());

    vfs_symlink(&ctx(), b"/chain-40", b"/chain-41").unwrap();
    assert_eq!(stat_path(b"/chain-41").unwrap_err(), Errno::ELOOP);

    for i in 1..=41 {
        let p = format!("/chain-{}", i).into_bytes();
        vfs_unlink(&ctx(), &p, false, core::ptr::null_mut()).unwrap();
    }
    vfs_unlink(&ctx(), b"/chain-target", false, core::ptr::null_mut()).unwrap();
}

#[test]
fn test_hole_reads_as_zeros() {
    let _g = with_fs();
    let file = open(b"/holey.bin", O_CREAT | O_RDWR, 0o644);

    unsafe { (*file).pos = 8192 };
    assert_eq!(write_file(file, b"tail"), 4);

    unsafe { (*file).pos = 0 };
    let mut buf = vec![0xFFu8; 8192];
    assert_eq!(read_file(file, &mut buf), 8192);
    assert!(buf.iter().all(|&b| b == 0));

    closef(file);
    vfs_unlink(&ctx(), b"/holey.bin", false, core::ptr::null_mut()).unwrap();
}

#[test]
fn test_shared_cache_page_share_counts() {
    let _g = with_fs();
    let file = open(b"/shared.bin", O_CREAT | O_RDWR, 0o644);
    assert_eq!(write_file(file, &[1u8; 512]), 512);
    let node = unsafe { (*file).node };

    // First acquisition: the entry's own share plus ours.
    let p1 = get_cached_page(node, 0, 0);
    assert!(!p1.is_null());
    assert!(crate::pcache::node_has_cached_pages(node) >= 1);
    let phys = unsafe { (*p1).phys };
    assert_eq!(get_frame_shares(phys), 2);

    // Hand the frame to a "mapping": BUSY drops, the share stays.
    release_cached_page_keep_share(p1);
    assert_eq!(get_frame_shares(phys), 2);

    // Second holder sees the same frame; three owners total.
    let p2 = get_cached_page(node, 0, 0);
    assert_eq!(p2, p1);
    assert_eq!(unsafe { (*p2).phys }, phys);
    assert_eq!(get_frame_shares(phys), 3);

    release_cached_page(p2);
    dec_frame_shares(phys); // the simulated mapping goes away
    assert_eq!(get_frame_shares(phys), 1);

    closef(file);
    vfs_unlink(&ctx(), b"/shared.bin", false, core::ptr::null_mut()).unwrap();
}

#[test]
fn test_rename_same_directory() {
    let _g = with_fs();
    let file = open(b"/before-name", O_CREAT | O_WRONLY, 0o644);
    assert_eq!(write_file(file, b"xyz"), 3);
    closef(file);

    vfs_rename(&ctx(), b"/before-name", b"/after-name").unwrap();
    assert_eq!(stat_path(b"/before-name").unwrap_err(), Errno::ENOENT);
    assert_eq!(stat_path(b"/after-name").unwrap().st_size, 3);
    vfs_unlink(&ctx(), b"/after-name", false, core::ptr::null_mut()).unwrap();
}

#[test]
fn test_mount_point_traversal() {
    let _g = with_fs();
    ramdisk_create(1, 512, 512).unwrap();
    memfs_format(MNT_DEV, 512, 32, 512).unwrap();
    vfs_mkdir(&ctx(), b"/mnt", 0o755, core::ptr::null_mut()).unwrap();

    let before = stat_path(b"/mnt").unwrap();
    assert_eq!(before.st_dev, ROOT_DEV as u64);

    // Resolve the mount point without crossing, then mount on it.
    let mpoint = vfs_lookup(&ctx(), b"/mnt", core::ptr::null_mut(), true).unwrap();
    vfs_mount(MNT_DEV, mpoint, b"memfs", 0).unwrap();

    let after = stat_path(b"/mnt").unwrap();
    assert_eq!(after.st_dev, MNT_DEV as u64);

    // "." stays inside the mounted fs; ".." leaves it.
    assert_eq!(stat_path(b"/mnt/.").unwrap().st_dev, MNT_DEV as u64);
    assert_eq!(stat_path(b"/mnt/..").unwrap().st_dev, ROOT_DEV as u64);

    // Files created under the mount land on the mounted device.
    let file = open(b"/mnt/inner.txt", O_CREAT | O_WRONLY, 0o644);
    assert_eq!(write_file(file, b"inner"), 5);
    closef(file);
    assert_eq!(stat_path(b"/mnt/inner.txt").unwrap().st_dev, MNT_DEV as u64);
}

#[test]
fn test_open_truncate_discards_content() {
    let _g = with_fs();
    let file = open(b"/trunc.bin", O_CREAT | O_WRONLY, 0o644);
    assert_eq!(write_file(file, &[9u8; 6000]), 6000);
    closef(file);

    let file = open(b"/trunc.bin", O_WRONLY | O_TRUNC, 0);
    closef(file);
    assert_eq!(stat_path(b"/trunc.bin").unwrap().st_size, 0);
    vfs_unlink(&ctx(), b"/trunc.bin", false, core::ptr::null_mut()).unwrap();
}

#[test]
fn test_pipe_write_then_read_and_eof() {
    let _g = with_fs();
    let (rfile, wfile) = pipe_create().unwrap();

    assert_eq!(write_file(wfile, b"through the pipe"), 16);
    let mut buf = [0u8; 32];
    assert_eq!(read_file(rfile, &mut buf), 16);
    assert_eq!(&buf[..16], b"through the pipe");

    // Closing the write end turns an empty pipe into EOF.
    closef(wfile);
    assert_eq!(read_file(rfile, &mut buf), 0);
    closef(rfile);
}

// ---------------------------------------------------------------------------
// Read coalescing against a fixed block map (recorder device + fixfs)
// ---------------------------------------------------------------------------

const REC_MAJOR: u32 = 200;
const REC_DEV: DevId = to_devid(REC_MAJOR, 0);
const REC_BLOCKS: usize = 256;
const REC_BSZ: usize = 512;

static REC_CALLS: Mutex<Vec<(u64, usize)>> = Mutex::new(Vec::new());
static REC_DISK: Mutex<Vec<u8>> = Mutex::new(Vec::new());

fn recorder_strategy(req: &mut DiskReq) -> i64 {
    let mut disk = REC_DISK.lock().unwrap();
    if disk.is_empty() {
        disk.resize(REC_BLOCKS * REC_BSZ, 0);
    }
    let off = req.blockno as usize * REC_BSZ;
    if off + req.datasz > disk.len() {
        return Errno::EIO.as_neg();
    }
    if !req.write {
        REC_CALLS.lock().unwrap().push((req.blockno, req.datasz));
        unsafe {
            core::ptr::copy_nonoverlapping(disk.as_ptr().add(off), req.data, req.datasz);
        }
    } else {
        unsafe {
            core::ptr::copy_nonoverlapping(req.data, disk.as_mut_ptr().add(off), req.datasz);
        }
    }
    req.datasz as i64
}

/// A fixture filesystem whose file (inode 2) maps to a fixed set of disk
/// blocks: two runs of four consecutive blocks each.
struct FixFs;

const FIX_MAP: [u64; 8] = [100, 101, 102, 103, 120, 121, 122, 123];

impl FsOps for FixFs {
    fn read_inode(&self, node: *mut Node) -> Result<(), Errno> {
        let n = unsafe { &mut *node };
        match n.inode {
            1 => {
                n.mode = S_IFDIR | 0o755;
                n.links = 2;
            }
            2 => {
                n.mode = S_IFREG | 0o644;
                n.links = 1;
                n.size = 4096;
            }
            _ => return Err(Errno::ENOENT),
        }
        Ok(())
    }

    fn write_inode(&self, _node: *mut Node) -> Result<(), Errno> {
        Ok(())
    }

    fn alloc_inode(&self, _node: *mut Node) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }

    fn free_inode(&self, _node: *mut Node) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }

    fn bmap(&self, node: *mut Node, lblock: u64, _bsz: usize, _flag: BmapFlag) -> u64 {
        if unsafe { (*node).inode } == 2 && (lblock as usize) < FIX_MAP.len() {
            FIX_MAP[lblock as usize]
        } else {
            0
        }
    }

    fn read_symlink(&self, _node: *mut Node, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::EINVAL)
    }

    fn write_symlink(&self, _node: *mut Node, _target: &[u8]) -> Result<usize, Errno> {
        Err(Errno::EROFS)
    }

    fn finddir(&self, _dir: *mut Node, name: &[u8]) -> Result<DirentLoc, Errno> {
        if name == b"fixed.bin" {
            Ok(DirentLoc {
                ino: 2,
                name_len: name.len(),
                name: {
                    let mut n = [0u8; cinder_abi::fs::NAME_MAX];
                    n[..name.len()].copy_from_slice(name);
                    n
                },
                page: core::ptr::null_mut(),
                offset: 0,
            })
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn finddir_by_inode(&self, _dir: *mut Node, _node: *mut Node) -> Result<DirentLoc, Errno> {
        Err(Errno::ENOENT)
    }

    fn addir(&self, _dir: *mut Node, _name: &[u8], _ino: InodeId) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }

    fn mkdir(&self, _dir: *mut Node, _parent: InodeId) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }

    fn deldir(&self, _dir: *mut Node, _loc: &DirentLoc, _last: bool) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }

    fn dir_empty(&self, _dir: *mut Node) -> bool {
        false
    }

    fn getdents(&self, _dir: *mut Node, _pos: &mut u64, _buf: &mut [u8]) -> Result<usize, Errno> {
        Ok(0)
    }

    fn read_super(&self, dev: DevId, minfo: *mut MountInfo) -> Result<(), Errno> {
        unsafe {
            (*minfo).block_size = REC_BSZ;
        }
        let root = get_node(dev, 1, false)?;
        unsafe {
            (*minfo).root = root;
        }
        Ok(())
    }

    fn write_super(&self, _dev: DevId) -> Result<(), Errno> {
        Ok(())
    }

    fn put_super(&self, _dev: DevId) {}

    fn ustat(&self, _minfo: *mut MountInfo, _buf: &mut FsUstat) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }

    fn statfs(&self, _minfo: *mut MountInfo, _buf: &mut FsStatfs) -> Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }
}

static FIXFS: FixFs = FixFs;

#[test]
fn test_page_fill_coalesces_consecutive_blocks() {
    let _g = with_fs();

    bdev_register(
        REC_MAJOR,
        BlockDevOps {
            strategy: Some(recorder_strategy),
        },
    )
    .unwrap();

    // Give each mapped block a recognizable payload.
    {
        let mut disk = REC_DISK.lock().unwrap();
        if disk.is_empty() {
            disk.resize(REC_BLOCKS * REC_BSZ, 0);
        }
        for (i, &b) in FIX_MAP.iter().enumerate() {
            let off = b as usize * REC_BSZ;
            for x in disk[off..off + REC_BSZ].iter_mut() {
                *x = i as u8 + 1;
            }
        }
    }

    fs_register(b"fixfs", &FIXFS).unwrap();
    vfs_mkdir(&ctx(), b"/fix", 0o755, core::ptr::null_mut()).unwrap();
    let mpoint = vfs_lookup(&ctx(), b"/fix", core::ptr::null_mut(), true).unwrap();
    vfs_mount(REC_DEV, mpoint, b"fixfs", 0).unwrap();

    let node = get_node(REC_DEV, 2, false).unwrap();

    REC_CALLS.lock().unwrap().clear();
    let page = get_cached_page(node, 0, 0);
    assert!(!page.is_null());

    // Two runs of four consecutive 512-byte blocks: exactly two reads.
    let calls = REC_CALLS.lock().unwrap().clone();
    assert_eq!(calls, vec![(100, 4 * REC_BSZ), (120, 4 * REC_BSZ)]);

    // And the page is the concatenation of the eight blocks.
    let data = unsafe { core::slice::from_raw_parts((*page).virt, 4096) };
    for (i, chunk) in data.chunks(REC_BSZ).enumerate() {
        assert!(chunk.iter().all(|&b| b == i as u8 + 1));
    }

    release_cached_page(page);
    release_node(node);
}
