//! Anonymous pipes.
//!
//! A pipe is an anonymous node whose buffer is one page frame. The ring
//! state lives in the node's block-pointer array, which pipes have no other
//! use for: `[0]` head, `[1]` tail, `[2]` the buffer frame, `[3]` byte
//! count, `[4]` reader count, `[5]` writer count. Readers and writers
//! block on two wait channels derived from the node's address.

use cinder_abi::addr::PAGE_SIZE;
use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{O_NONBLOCK, O_RDONLY, O_WRONLY, POLLHUP, POLLIN, POLLOUT, S_IFIFO, SEL_READ};
use cinder_abi::signal::SIGPIPE;
use cinder_lib::services;
use cinder_mm::page_alloc::{ALLOC_FLAG_ZERO, alloc_page_frame, frame_virt, free_page_frame};

use cinder_abi::addr::PhysAddr;
use cinder_abi::fs::to_devid;

use crate::fileio::{File, PREAD_MODE, PWRITE_MODE, closef, falloc};
use crate::node::{FS_NODE_PIPE, Node, alloc_anon_node, node_ref};

/// Pseudo-device id pipes are created under.
pub const PIPE_DEVID: u32 = to_devid(0xff, 1);

const PIPE_BUF_SIZE: u64 = PAGE_SIZE;

const HEAD: usize = 0;
const TAIL: usize = 1;
const FRAME: usize = 2;
const COUNT: usize = 3;
const READERS: usize = 4;
const WRITERS: usize = 5;

#[inline]
fn read_channel(node: *mut Node) -> usize {
    node as usize
}

#[inline]
fn write_channel(node: *mut Node) -> usize {
    node as usize + 1
}

fn pipe_buf(node: *mut Node) -> *mut u8 {
    frame_virt(PhysAddr::new(unsafe { (*node).blocks[FRAME] }))
}

/// Create a pipe: returns the read and write file-table entries.
pub fn pipe_create() -> KResult<(*mut File, *mut File)> {
    let node = alloc_anon_node(PIPE_DEVID)?;
    let frame = alloc_page_frame(ALLOC_FLAG_ZERO);
    if frame.is_null() {
        crate::node::release_node(node);
        return Err(Errno::ENOMEM);
    }

    {
        let n = unsafe { &mut *node };
        n.mode = S_IFIFO | 0o600;
        n.set_flag(FS_NODE_PIPE);
        n.blocks[FRAME] = frame.as_u64();
        n.blocks[READERS] = 1;
        n.blocks[WRITERS] = 1;
        n.read = Some(pipe_read);
        n.write = Some(pipe_write);
        n.select = Some(pipe_select);
        n.poll = Some(pipe_poll);
    }

    let rfile = match falloc() {
        Ok(f) => f,
        Err(e) => {
            crate::node::release_node(node);
            return Err(e);
        }
    };
    let wfile = match falloc() {
        Ok(f) => f,
        Err(e) => {
            closef(rfile);
            crate::node::release_node(node);
            return Err(e);
        }
    };

    node_ref(node); // second file's reference
    unsafe {
        (*rfile).mode = PREAD_MODE;
        (*rfile).flags = O_RDONLY;
        (*rfile).node = node;
        (*wfile).mode = PWRITE_MODE;
        (*wfile).flags = O_WRONLY;
        (*wfile).node = node;
    }
    Ok((rfile, wfile))
}

/// Read from the ring; blocks while empty and writers remain. EOF once the
/// last writer is gone.
pub fn pipe_read(file: *mut File, _pos: *mut u64, buf: &mut [u8]) -> KResult<usize> {
    let node = unsafe { (*file).node };
    if buf.is_empty() {
        return Ok(0);
    }

    loop {
        let n = unsafe { &mut *node };
        n.lock.lock();
        let count = n.blocks[COUNT];

        if count == 0 {
            let widowed = n.blocks[WRITERS] == 0;
            n.lock.unlock();
            if widowed {
                return Ok(0);
            }
            if unsafe { (*file).flags } & O_NONBLOCK != 0 {
                return Err(Errno::EAGAIN);
            }
            let res = services::block_on(read_channel(node), true, 0);
            if res == Errno::EINTR.as_neg() as i32 {
                // Interrupted sleep: the dispatcher decides between a
                // transparent restart and EINTR based on the handler.
                return Err(Errno::ERESTARTSYS);
            }
            continue;
        }

        let chunk = core::cmp::min(buf.len() as u64, count) as usize;
        let base = pipe_buf(node);
        let mut head = n.blocks[HEAD];
        for b in buf.iter_mut().take(chunk) {
            *b = unsafe { *base.add(head as usize) };
            head = (head + 1) % PIPE_BUF_SIZE;
        }
        n.blocks[HEAD] = head;
        n.blocks[COUNT] -= chunk as u64;
        n.lock.unlock();

        services::unblock_all(write_channel(node));
        return Ok(chunk);
    }
}

/// Write into the ring; blocks while full. Writing with no readers left
/// raises SIGPIPE and fails with EPIPE.
pub fn pipe_write(file: *mut File, _pos: *mut u64, buf: &[u8]) -> KResult<usize> {
    let node = unsafe { (*file).node };
    let mut written = 0usize;

    while written < buf.len() {
        let n = unsafe { &mut *node };
        n.lock.lock();

        if n.blocks[READERS] == 0 {
            n.lock.unlock();
            services::post_signal_current(SIGPIPE, 0, 0);
            return Err(Errno::EPIPE);
        }

        let count = n.blocks[COUNT];
        if count == PIPE_BUF_SIZE {
            n.lock.unlock();
            if unsafe { (*file).flags } & O_NONBLOCK != 0 {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(Errno::EAGAIN)
                };
            }
            let res = services::block_on(write_channel(node), true, 0);
            if res == Errno::EINTR.as_neg() as i32 {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(Errno::ERESTARTSYS)
                };
            }
            continue;
        }

        let room = (PIPE_BUF_SIZE - count) as usize;
        let chunk = core::cmp::min(buf.len() - written, room);
        let base = pipe_buf(node);
        let mut tail = n.blocks[TAIL];
        for &b in buf[written..written + chunk].iter() {
            unsafe { *base.add(tail as usize) = b };
            tail = (tail + 1) % PIPE_BUF_SIZE;
        }
        n.blocks[TAIL] = tail;
        n.blocks[COUNT] += chunk as u64;
        n.lock.unlock();

        written += chunk;
        services::unblock_all(read_channel(node));
    }

    Ok(written)
}

pub fn pipe_select(file: *mut File, which: i32) -> bool {
    let node = unsafe { (*file).node };
    let n = unsafe { &*node };
    if which == SEL_READ {
        n.blocks[COUNT] > 0 || n.blocks[WRITERS] == 0
    } else {
        n.blocks[COUNT] < PIPE_BUF_SIZE || n.blocks[READERS] == 0
    }
}

pub fn pipe_poll(file: *mut File) -> u32 {
    let node = unsafe { (*file).node };
    let n = unsafe { &*node };
    let mut revents = 0;
    if n.blocks[COUNT] > 0 {
        revents |= POLLIN;
    }
    if n.blocks[COUNT] < PIPE_BUF_SIZE {
        revents |= POLLOUT;
    }
    if n.blocks[WRITERS] == 0 || n.blocks[READERS] == 0 {
        revents |= POLLHUP;
    }
    revents
}

/// One end of the pipe is closing: drop its count and wake the peer so a
/// blocked reader sees EOF / a blocked writer sees EPIPE.
pub fn pipe_close_end(node: *mut Node, file_mode: u16) {
    let n = unsafe { &mut *node };
    n.lock.lock();
    if file_mode & PREAD_MODE != 0 && n.blocks[READERS] > 0 {
        n.blocks[READERS] -= 1;
    }
    if file_mode & PWRITE_MODE != 0 && n.blocks[WRITERS] > 0 {
        n.blocks[WRITERS] -= 1;
    }
    n.lock.unlock();
    services::unblock_all(read_channel(node));
    services::unblock_all(write_channel(node));
}

/// Final release of a pipe node: wake any stragglers and free the buffer.
pub fn pipe_release_node(node: *mut Node) {
    services::unblock_all(read_channel(node));
    services::unblock_all(write_channel(node));
    let n = unsafe { &mut *node };
    let frame = PhysAddr::new(n.blocks[FRAME]);
    if !frame.is_null() {
        free_page_frame(frame);
        n.blocks[FRAME] = 0;
    }
}
