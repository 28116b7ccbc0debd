//! The open-file table.
//!
//! A global array of `File` records; tasks map small integers to entries
//! here through their per-task descriptor tables. An entry is shared (and
//! reference-counted) across dup and fork; the node reference is dropped on
//! the last close.

use core::ptr;

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{O_ACCMODE, O_RDONLY, O_RDWR, O_WRONLY, SEEK_CUR, SEEK_END, SEEK_SET};
use cinder_lib::{IrqMutex, klog_error};

use crate::node::{FS_NODE_PIPE, Node, release_node};

pub const NR_FILE: usize = 128;

/// Pipe-end markers kept in `File::mode` alongside the access mode.
pub const PREAD_MODE: u16 = 1;
pub const PWRITE_MODE: u16 = 2;

#[repr(C)]
pub struct File {
    /// Access/pipe-end mode.
    pub mode: u16,
    /// The open flags (O_APPEND, O_NONBLOCK, O_CLOEXEC, O_PATH, ...).
    pub flags: u32,
    pub refs: u32,
    pub node: *mut Node,
    pub pos: u64,
}

unsafe impl Send for File {}

impl File {
    const fn empty() -> Self {
        Self {
            mode: 0,
            flags: 0,
            refs: 0,
            node: ptr::null_mut(),
            pos: 0,
        }
    }

    #[inline]
    pub fn readable(&self) -> bool {
        matches!(self.flags & O_ACCMODE, O_RDONLY | O_RDWR)
    }

    #[inline]
    pub fn writable(&self) -> bool {
        matches!(self.flags & O_ACCMODE, O_WRONLY | O_RDWR)
    }
}

static mut FILE_TABLE: [File; NR_FILE] = [const { File::empty() }; NR_FILE];
static FILE_LOCK: IrqMutex<()> = IrqMutex::new(());

fn fslot(i: usize) -> *mut File {
    // SAFETY: i < NR_FILE at every call site.
    unsafe { ((&raw mut FILE_TABLE) as *mut File).add(i) }
}

/// Allocate a file-table entry with one reference.
pub fn falloc() -> KResult<*mut File> {
    let _g = FILE_LOCK.lock();
    for i in 0..NR_FILE {
        let f = fslot(i);
        let r = unsafe { &mut *f };
        if r.refs == 0 {
            *r = File::empty();
            r.refs = 1;
            return Ok(f);
        }
    }
    klog_error!("vfs: master file table full");
    Err(Errno::ENFILE)
}

/// Add a reference (dup, fork).
pub fn file_ref(file: *mut File) {
    if file.is_null() {
        return;
    }
    let _g = FILE_LOCK.lock();
    unsafe { (*file).refs += 1 };
}

/// Drop one reference; the last close releases the node (and does the
/// pipe-end bookkeeping first, so a widowed end wakes its peer).
pub fn closef(file: *mut File) {
    if file.is_null() {
        return;
    }

    let last = {
        let _g = FILE_LOCK.lock();
        let f = unsafe { &mut *file };
        if f.refs == 0 {
            klog_error!("vfs: file ref underflow");
            return;
        }
        f.refs -= 1;
        f.refs == 0
    };
    if !last {
        return;
    }

    let f = unsafe { &mut *file };
    let node = f.node;
    if !node.is_null() {
        if unsafe { (*node).has_flag(FS_NODE_PIPE) } {
            crate::pipefs::pipe_close_end(node, f.mode);
        }
        release_node(node);
    }
    f.node = ptr::null_mut();
    f.mode = 0;
    f.flags = 0;
    f.pos = 0;
}

/// lseek arithmetic against the file's node. Pipes are unseekable.
pub fn file_lseek(file: *mut File, offset: i64, whence: u32) -> KResult<u64> {
    let f = unsafe { &mut *file };
    let node = f.node;
    if node.is_null() {
        return Err(Errno::EBADF);
    }
    if unsafe { (*node).has_flag(FS_NODE_PIPE) } {
        return Err(Errno::ESPIPE);
    }

    let base = match whence {
        SEEK_SET => 0i64,
        SEEK_CUR => f.pos as i64,
        SEEK_END => unsafe { (*node).size as i64 },
        _ => return Err(Errno::EINVAL),
    };
    let new = base.checked_add(offset).ok_or(Errno::EINVAL)?;
    if new < 0 {
        return Err(Errno::EINVAL);
    }
    f.pos = new as u64;
    Ok(f.pos)
}
