//! The incore node table.
//!
//! A bounded set of in-memory inodes keyed by `(device, inode number)`.
//! Nodes are reference-counted across open files, path walks and cached
//! pages; a node only matches lookups while it has live references, so a
//! zero-ref inode is by construction absent from the table and has no
//! cached pages (each cached page holds a node reference of its own).

use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{DevId, InodeId, s_isdir};
use cinder_lib::{IrqMutex, KernelMutex, klog_error, services};

use crate::fsops::{BmapFlag, FsOps};
use crate::mount::get_mount_info;
use crate::pcache;

pub const NR_INODE: usize = 64;

/// Node flag bits.
pub const FS_NODE_DIRTY: u32 = 0x01;
pub const FS_NODE_PIPE: u32 = 0x02;
pub const FS_NODE_MOUNTPOINT: u32 = 0x04;
pub const FS_NODE_SOCKET: u32 = 0x08;

/// Per-node I/O entry points, installed at open time (see `dispatch`).
pub type NodeReadFn = fn(file: *mut crate::fileio::File, pos: *mut u64, buf: &mut [u8]) -> KResult<usize>;
pub type NodeWriteFn = fn(file: *mut crate::fileio::File, pos: *mut u64, buf: &[u8]) -> KResult<usize>;
/// `which` is 0 for read-readiness, 1 for write-readiness.
pub type NodeSelectFn = fn(file: *mut crate::fileio::File, which: i32) -> bool;
/// Returns poll revents bits.
pub type NodePollFn = fn(file: *mut crate::fileio::File) -> u32;

/// An incore inode.
#[repr(C)]
pub struct Node {
    pub dev: DevId,
    pub inode: InodeId,
    pub refs: AtomicU32,

    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub size: u64,
    pub links: u32,
    /// Disk block pointers, the 12-direct + indirect convention. Pipes use
    /// [0]/[1] as head/tail and [2] for the buffer frame.
    pub blocks: [u64; 15],

    pub lock: KernelMutex,
    pub flags: u32,
    pub ops: Option<&'static dyn FsOps>,
    /// Alias pointer: for a mount point, the mounted root; for the mounted
    /// root, the mount point underneath it.
    pub ptr: *mut Node,

    pub read: Option<NodeReadFn>,
    pub write: Option<NodeWriteFn>,
    pub select: Option<NodeSelectFn>,
    pub poll: Option<NodePollFn>,
}

unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    const fn empty() -> Self {
        Self {
            dev: 0,
            inode: 0,
            refs: AtomicU32::new(0),
            mode: 0,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            size: 0,
            links: 0,
            blocks: [0; 15],
            lock: KernelMutex::new(),
            flags: 0,
            ops: None,
            ptr: ptr::null_mut(),
            read: None,
            write: None,
            select: None,
            poll: None,
        }
    }

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    #[inline]
    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        s_isdir(self.mode)
    }
}

static mut NODE_TABLE: [Node; NR_INODE] = [const { Node::empty() }; NR_INODE];

static NODE_LOCK: IrqMutex<()> = IrqMutex::new(());

fn table() -> *mut Node {
    (&raw mut NODE_TABLE) as *mut Node
}

#[inline]
fn slot(i: usize) -> *mut Node {
    // SAFETY: i < NR_INODE at every call site.
    unsafe { table().add(i) }
}

/// Bump a node's reference count.
pub fn node_ref(node: *mut Node) {
    if !node.is_null() {
        unsafe { (*node).refs.fetch_add(1, Ordering::AcqRel) };
    }
}

/// Check whether `(dev, n)` is resident with live references.
pub fn node_is_incore(dev: DevId, n: InodeId) -> bool {
    let _g = NODE_LOCK.lock();
    for i in 0..NR_INODE {
        let node = unsafe { &*slot(i) };
        if node.dev == dev && node.inode == n && node.refs.load(Ordering::Acquire) > 0 {
            return true;
        }
    }
    false
}

/// Count live references held against nodes of `dev` (umount busy check).
pub fn count_device_node_refs(dev: DevId, skip: *mut Node) -> u32 {
    let _g = NODE_LOCK.lock();
    let mut total = 0;
    for i in 0..NR_INODE {
        let node = slot(i);
        if node == skip {
            continue;
        }
        let n = unsafe { &*node };
        if n.dev == dev {
            total += n.refs.load(Ordering::Acquire);
        }
    }
    total
}

/// Return an existing incore node (reference bumped) or load one from disk.
///
/// With `follow_mpoints` set, a mount-point inode is transparently switched
/// to the mounted filesystem's root.
pub fn get_node(dev: DevId, n: InodeId, follow_mpoints: bool) -> KResult<*mut Node> {
    if dev == 0 || n == 0 {
        return Err(Errno::EINVAL);
    }

    let found = {
        let _g = NODE_LOCK.lock();
        let mut found: *mut Node = ptr::null_mut();
        let mut empty: *mut Node = ptr::null_mut();
        for i in 0..NR_INODE {
            let node = slot(i);
            let r = unsafe { &*node };
            if r.refs.load(Ordering::Acquire) > 0 {
                if r.dev == dev && r.inode == n {
                    found = node;
                    break;
                }
            } else if r.dev == 0 && empty.is_null() {
                empty = node;
            }
        }

        if !found.is_null() {
            let node = unsafe { &mut *found };
            if follow_mpoints && node.has_flag(FS_NODE_MOUNTPOINT) && !node.ptr.is_null() {
                let root = node.ptr;
                unsafe { (*root).refs.fetch_add(1, Ordering::AcqRel) };
                return Ok(root);
            }
            node.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(found);
        }

        if empty.is_null() {
            klog_error!("vfs: incore node table full");
            return Err(Errno::ENFILE);
        }

        let minfo = get_mount_info(dev);
        if minfo.is_null() {
            return Err(Errno::ENODEV);
        }
        let node = unsafe { &mut *empty };
        *node = Node::empty();
        node.dev = dev;
        node.inode = n;
        node.ops = unsafe { (*minfo).fs_ops };
        node.refs.store(1, Ordering::Release);
        empty
    };

    // Table lock dropped: the disk read may block.
    let node = unsafe { &mut *found };
    let ops = node.ops.ok_or(Errno::ENODEV)?;
    if let Err(e) = ops.read_inode(found) {
        let _g = NODE_LOCK.lock();
        node.refs.store(0, Ordering::Release);
        node.dev = 0;
        node.inode = 0;
        return Err(e);
    }

    if follow_mpoints && node.has_flag(FS_NODE_MOUNTPOINT) && !node.ptr.is_null() {
        let root = node.ptr;
        node_ref(root);
        release_node(found);
        return Ok(root);
    }

    Ok(found)
}

/// Free every disk block past `new_size` via `bmap FREE` and shrink the
/// node. The node lock is taken here.
pub fn truncate_node(node: *mut Node, new_size: u64) -> KResult<()> {
    let n = unsafe { &mut *node };
    let ops = n.ops.ok_or(Errno::EINVAL)?;
    let minfo = get_mount_info(n.dev);
    if minfo.is_null() {
        return Err(Errno::ENODEV);
    }
    let bsz = unsafe { (*minfo).block_size };
    if bsz == 0 {
        return Err(Errno::EINVAL);
    }

    // Fills allocate whole pages of blocks, so the span to free is the
    // size rounded up to page granularity.
    let page = cinder_abi::addr::PAGE_SIZE;
    let old_blocks = n.size.div_ceil(page) * (page / bsz as u64);
    let keep_blocks = new_size.div_ceil(bsz as u64);

    {
        let _g = n.lock.guard();
        for lblock in keep_blocks..old_blocks {
            ops.bmap(node, lblock, bsz, BmapFlag::Free);
        }
        n.size = new_size;
        n.flags |= FS_NODE_DIRTY;
    }
    Ok(())
}

/// Allocate a brand-new inode on `dev`.
pub fn new_node(dev: DevId) -> KResult<*mut Node> {
    let minfo = get_mount_info(dev);
    if minfo.is_null() {
        return Err(Errno::ENODEV);
    }
    let ops = unsafe { (*minfo).fs_ops }.ok_or(Errno::ENODEV)?;

    let found = {
        let _g = NODE_LOCK.lock();
        let mut empty: *mut Node = ptr::null_mut();
        for i in 0..NR_INODE {
            let node = slot(i);
            let r = unsafe { &*node };
            if r.refs.load(Ordering::Acquire) == 0 && r.dev == 0 {
                empty = node;
                break;
            }
        }
        if empty.is_null() {
            return Err(Errno::ENFILE);
        }
        let node = unsafe { &mut *empty };
        *node = Node::empty();
        node.dev = dev;
        node.ops = Some(ops);
        node.refs.store(1, Ordering::Release);
        empty
    };

    if let Err(e) = ops.alloc_inode(found) {
        let node = unsafe { &mut *found };
        let _g = NODE_LOCK.lock();
        node.refs.store(0, Ordering::Release);
        node.dev = 0;
        return Err(e);
    }
    Ok(found)
}

/// Grab a node slot with no backing filesystem (pipes, sockets). The
/// caller owns the single reference and is responsible for the node's
/// resources.
pub fn alloc_anon_node(dev: DevId) -> KResult<*mut Node> {
    let _g = NODE_LOCK.lock();
    for i in 0..NR_INODE {
        let node = slot(i);
        let r = unsafe { &mut *node };
        if r.refs.load(Ordering::Acquire) == 0 && r.dev == 0 {
            *r = Node::empty();
            r.dev = dev;
            r.inode = node as usize as InodeId;
            r.refs.store(1, Ordering::Release);
            return Ok(node);
        }
    }
    Err(Errno::ENFILE)
}

/// Flush incore metadata to disk and clear the dirty flag.
pub fn write_node(node: *mut Node) -> KResult<()> {
    let n = unsafe { &mut *node };
    let ops = n.ops.ok_or(Errno::EINVAL)?;
    ops.write_inode(node)?;
    n.clear_flag(FS_NODE_DIRTY);
    Ok(())
}

/// Drop one reference. On the last release: pipes wake their sleepers and
/// free the buffer; unlinked files are truncated and their inode freed;
/// dirty nodes are written back. The slot then leaves the table.
pub fn release_node(node: *mut Node) {
    if node.is_null() {
        return;
    }
    let n = unsafe { &mut *node };

    let prev = {
        let _g = NODE_LOCK.lock();
        n.refs.fetch_sub(1, Ordering::AcqRel)
    };

    if prev == 0 {
        klog_error!("vfs: node ref underflow (dev {:#x}, ino {})", n.dev, n.inode);
        n.refs.store(0, Ordering::Release);
        return;
    }

    if prev > 1 {
        // A deleted file's remaining references are typically its cached
        // pages; push them out now so the blocks are reclaimed promptly.
        if n.links == 0 && !n.has_flag(FS_NODE_PIPE) && !n.has_flag(FS_NODE_SOCKET) {
            let _ = pcache::remove_cached_node_pages(node);
        }
        return;
    }

    // Last reference.
    if n.has_flag(FS_NODE_PIPE) {
        crate::pipefs::pipe_release_node(node);
    } else if n.links == 0 && n.ops.is_some() {
        let _ = truncate_node(node, 0);
        if let Some(ops) = n.ops {
            let _ = ops.free_inode(node);
        }
    } else if n.has_flag(FS_NODE_DIRTY) {
        let _ = write_node(node);
    }

    services::unblock_all(node as usize);

    let _g = NODE_LOCK.lock();
    if n.refs.load(Ordering::Acquire) == 0 {
        *n = Node::empty();
    }
}

/// Write back every dirty node of `dev` (all devices when `dev == 0`).
pub fn sync_nodes(dev: DevId) {
    for i in 0..NR_INODE {
        let node = slot(i);
        let n = unsafe { &mut *node };
        if n.refs.load(Ordering::Acquire) == 0 {
            continue;
        }
        if dev != 0 && n.dev != dev {
            continue;
        }
        if n.has_flag(FS_NODE_DIRTY) {
            let _ = write_node(node);
        }
    }
}

/// Update access time (called by the read paths).
pub fn update_atime(node: *mut Node) {
    let n = unsafe { &mut *node };
    n.atime = cinder_lib::clock::ticks();
    n.set_flag(FS_NODE_DIRTY);
}

/// Update modification time.
pub fn update_mtime(node: *mut Node) {
    let n = unsafe { &mut *node };
    n.mtime = cinder_lib::clock::ticks();
    n.ctime = n.mtime;
    n.set_flag(FS_NODE_DIRTY);
}
