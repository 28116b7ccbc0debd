//! Per-node I/O dispatch.
//!
//! At open time every node is assigned its `read`/`write`/`select`/`poll`
//! entry points: O_PATH descriptors get refusing stubs, pipes their ring
//! handlers, character devices the registered driver's handlers (indexed
//! by the major number kept in `blocks[0]`), block-device special files go
//! through the raw page cache, and everything else gets the generic
//! page-cache-backed file I/O. This is the one place the rest of the
//! kernel decides "what kind of thing is this".

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{
    DevId, O_APPEND, O_PATH, POLLIN, POLLOUT, s_isblk, s_ischr, s_isfifo,
};
use cinder_lib::IrqMutex;

use crate::fileio::File;
use crate::node::{Node, NodeReadFn, NodeWriteFn};
use crate::pcache::{
    get_cached_block, mark_cached_page_dirty, release_cached_page,
};
use crate::pipefs;
use crate::vfs::{vfs_read_node, vfs_write_node};

// ---------------------------------------------------------------------------
// Character-device driver table
// ---------------------------------------------------------------------------

pub type CharReadFn = fn(dev: DevId, buf: &mut [u8]) -> KResult<usize>;
pub type CharWriteFn = fn(dev: DevId, buf: &[u8]) -> KResult<usize>;

#[derive(Clone, Copy)]
pub struct CharDevOps {
    pub read: Option<CharReadFn>,
    pub write: Option<CharWriteFn>,
}

impl CharDevOps {
    const fn empty() -> Self {
        Self {
            read: None,
            write: None,
        }
    }
}

pub const NR_CDEV: usize = 64;

static CDEV_TAB: IrqMutex<[CharDevOps; NR_CDEV]> =
    IrqMutex::new([const { CharDevOps::empty() }; NR_CDEV]);

pub fn cdev_register(maj: u32, ops: CharDevOps) -> KResult<()> {
    if maj as usize >= NR_CDEV {
        return Err(Errno::EINVAL);
    }
    CDEV_TAB.lock()[maj as usize] = ops;
    Ok(())
}

fn cdev_ops_for(node: *mut Node) -> CharDevOps {
    let dev = unsafe { (*node).blocks[0] } as DevId;
    let maj = cinder_abi::fs::major(dev) as usize;
    if maj >= NR_CDEV {
        return CharDevOps::empty();
    }
    CDEV_TAB.lock()[maj]
}

// ---------------------------------------------------------------------------
// Handler implementations
// ---------------------------------------------------------------------------

fn dummy_read(_file: *mut File, _pos: *mut u64, _buf: &mut [u8]) -> KResult<usize> {
    Err(Errno::EBADF)
}

fn dummy_write(_file: *mut File, _pos: *mut u64, _buf: &[u8]) -> KResult<usize> {
    Err(Errno::EBADF)
}

fn dummy_select(_file: *mut File, _which: i32) -> bool {
    false
}

fn dummy_poll(_file: *mut File) -> u32 {
    0
}

fn file_read(file: *mut File, pos: *mut u64, buf: &mut [u8]) -> KResult<usize> {
    let node = unsafe { (*file).node };
    vfs_read_node(node, unsafe { &mut *pos }, buf)
}

fn file_write(file: *mut File, pos: *mut u64, buf: &[u8]) -> KResult<usize> {
    let node = unsafe { (*file).node };
    if unsafe { (*file).flags } & O_APPEND != 0 {
        unsafe { *pos = (*node).size };
    }
    vfs_write_node(node, unsafe { &mut *pos }, buf)
}

fn file_select(_file: *mut File, _which: i32) -> bool {
    // Regular files are always ready.
    true
}

fn file_poll(_file: *mut File) -> u32 {
    POLLIN | POLLOUT
}

fn chardev_read(file: *mut File, _pos: *mut u64, buf: &mut [u8]) -> KResult<usize> {
    let ops = cdev_ops_for(unsafe { (*file).node });
    let dev = unsafe { (*(*file).node).blocks[0] } as DevId;
    match ops.read {
        Some(f) => f(dev, buf),
        None => Err(Errno::ENODEV),
    }
}

fn chardev_write(file: *mut File, _pos: *mut u64, buf: &[u8]) -> KResult<usize> {
    let ops = cdev_ops_for(unsafe { (*file).node });
    let dev = unsafe { (*(*file).node).blocks[0] } as DevId;
    match ops.write {
        Some(f) => f(dev, buf),
        None => Err(Errno::ENODEV),
    }
}

/// Block-device special file: raw blocks through the page cache.
fn blockdev_read(file: *mut File, pos: *mut u64, buf: &mut [u8]) -> KResult<usize> {
    let dev = unsafe { (*(*file).node).blocks[0] } as DevId;
    let minfo = crate::mount::get_mount_info(dev);
    if minfo.is_null() {
        return Err(Errno::ENODEV);
    }
    let bsz = unsafe { (*minfo).block_size } as u64;

    let mut total = 0usize;
    let pos = unsafe { &mut *pos };
    while total < buf.len() {
        let block = *pos / bsz;
        let off = (*pos % bsz) as usize;
        let page = get_cached_block(dev, block, 0);
        if page.is_null() {
            break;
        }
        let avail = unsafe { (*page).len } - off;
        let chunk = core::cmp::min(buf.len() - total, avail);
        unsafe {
            core::ptr::copy_nonoverlapping(
                (*page).virt.add(off),
                buf.as_mut_ptr().add(total),
                chunk,
            );
        }
        release_cached_page(page);
        *pos += chunk as u64;
        total += chunk;
    }
    if total == 0 && !buf.is_empty() {
        return Err(Errno::EIO);
    }
    Ok(total)
}

fn blockdev_write(file: *mut File, pos: *mut u64, buf: &[u8]) -> KResult<usize> {
    let dev = unsafe { (*(*file).node).blocks[0] } as DevId;
    let minfo = crate::mount::get_mount_info(dev);
    if minfo.is_null() {
        return Err(Errno::ENODEV);
    }
    let bsz = unsafe { (*minfo).block_size } as u64;

    let mut total = 0usize;
    let pos = unsafe { &mut *pos };
    while total < buf.len() {
        let block = *pos / bsz;
        let off = (*pos % bsz) as usize;
        let page = get_cached_block(dev, block, 0);
        if page.is_null() {
            break;
        }
        let avail = unsafe { (*page).len } - off;
        let chunk = core::cmp::min(buf.len() - total, avail);
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr().add(total),
                (*page).virt.add(off),
                chunk,
            );
        }
        mark_cached_page_dirty(page);
        release_cached_page(page);
        *pos += chunk as u64;
        total += chunk;
    }
    if total == 0 && !buf.is_empty() {
        return Err(Errno::EIO);
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Installation
// ---------------------------------------------------------------------------

/// Pick and install the node's I/O entry points for an open with `flags`.
pub fn install_node_io(node: *mut Node, flags: u32) {
    let n = unsafe { &mut *node };

    let (read, write): (NodeReadFn, NodeWriteFn);

    if flags & O_PATH != 0 {
        n.read = Some(dummy_read);
        n.write = Some(dummy_write);
        n.select = Some(dummy_select);
        n.poll = Some(dummy_poll);
        return;
    }

    if n.has_flag(crate::node::FS_NODE_PIPE) || s_isfifo(n.mode) {
        n.read = Some(pipefs::pipe_read);
        n.write = Some(pipefs::pipe_write);
        n.select = Some(pipefs::pipe_select);
        n.poll = Some(pipefs::pipe_poll);
        return;
    }

    if s_ischr(n.mode) {
        read = chardev_read;
        write = chardev_write;
    } else if s_isblk(n.mode) {
        read = blockdev_read;
        write = blockdev_write;
    } else {
        read = file_read;
        write = file_write;
    }

    n.read = Some(read);
    n.write = Some(write);
    n.select = Some(file_select);
    n.poll = Some(file_poll);
}
