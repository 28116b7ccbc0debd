//! The page cache.
//!
//! A process-wide hash table of page-sized cache entries keyed by
//! `(device, inode, page-aligned offset)`. File-backed entries carry a
//! strong reference to their node; raw-block entries (inode ==
//! `PCACHE_NOINODE`) cache device blocks directly and the key offset is a
//! block number. Every read and write above the driver layer goes through
//! here.
//!
//! Entry lifecycle is a flag word: `BUSY` gives the holder exclusive use,
//! `WANTED` records sleepers to wake on release, `DIRTY` schedules
//! writeback, `ALWAYS_DIRTY` re-arms dirty on every sweep (used when a
//! locked node kept a flush from completing), and `STALE` condemns the
//! entry — stale pages are discarded, never reused.
//!
//! Locking: the table lock is never held across a blocking operation. The
//! writeback path drops it around `sync_cached_page` (which takes the node
//! lock for `bmap`) and then restarts its bucket scan from the top, which
//! is why every sweep below is written as "restart the bucket after any
//! release".

use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use cinder_abi::addr::{PAGE_SIZE, PhysAddr};
use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{DevId, FsUstat, InodeId, major};
use cinder_lib::clock::{TWO_MINUTES, ticks};
use cinder_lib::{IrqMutex, klog_error, klog_warn, services};
use cinder_mm::page_alloc::{
    alloc_page_frame, dec_frame_shares, frame_virt, free_page_frame, get_frame_shares,
    inc_frame_shares,
};
use cinder_mm::{kfree, kmalloc_zeroed};

use crate::blockdev::{DiskReq, bdev_strategy};
use crate::fsops::BmapFlag;
use crate::mount::get_mount_info;
use crate::node::{Node, release_node};

/// Inode value marking raw-block entries.
pub const PCACHE_NOINODE: InodeId = u64::MAX;

// get_cached_page() request flags.
pub const PCACHE_PEEK_ONLY: u32 = 0x01;
pub const PCACHE_IGNORE_STALE: u32 = 0x02;
pub const PCACHE_AUTO_ALLOC: u32 = 0x04;

// Entry flags.
pub const PCACHE_FLAG_BUSY: u32 = 0x01;
pub const PCACHE_FLAG_WANTED: u32 = 0x02;
pub const PCACHE_FLAG_DIRTY: u32 = 0x04;
pub const PCACHE_FLAG_ALWAYS_DIRTY: u32 = 0x08;
pub const PCACHE_FLAG_STALE: u32 = 0x10;

/// Liveness bounds: a stale or busy page that cannot be acquired after this
/// many retries means someone is holding a reference forever, and limping
/// on would hide the bug.
const STALE_RETRY_LIMIT: u32 = 50;
const BUSY_RETRY_LIMIT: u32 = 500_000;

const BUSY_SLEEP_TICKS: u64 = 300;
const FLUSH_SLEEP_TICKS: u64 = 30;

pub struct CachedPage {
    pub dev: DevId,
    pub ino: InodeId,
    pub offset: u64,
    pub phys: PhysAddr,
    pub virt: *mut u8,
    pub len: usize,
    pub node: *mut Node,
    flags: AtomicU32,
    pub last_accessed: u64,
    /// Owning task at acquisition time, for diagnostics.
    pub pid: u32,
    next: *mut CachedPage,
}

impl CachedPage {
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    fn clear_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }
}

const PCACHE_BUCKETS: usize = 128;

struct PcacheTab {
    buckets: [*mut CachedPage; PCACHE_BUCKETS],
}

unsafe impl Send for PcacheTab {}

static PCACHE: IrqMutex<PcacheTab> = IrqMutex::new(PcacheTab {
    buckets: [ptr::null_mut(); PCACHE_BUCKETS],
});

// FNV-1a over the 24-byte key.
const FNV1A_PRIME: u32 = 0x0100_0193;
const FNV1A_SEED: u32 = 0x811C_9DC5;

fn bucket_of(dev: DevId, ino: InodeId, offset: u64) -> usize {
    let mut hash = FNV1A_SEED;
    let mut feed = |bytes: &[u8]| {
        for &b in bytes {
            hash = (b as u32 ^ hash).wrapping_mul(FNV1A_PRIME);
        }
    };
    feed(&(dev as u64).to_le_bytes());
    feed(&ino.to_le_bytes());
    feed(&offset.to_le_bytes());
    hash as usize % PCACHE_BUCKETS
}

fn lookup(tab: &PcacheTab, dev: DevId, ino: InodeId, offset: u64) -> *mut CachedPage {
    let mut cur = tab.buckets[bucket_of(dev, ino, offset)];
    unsafe {
        while !cur.is_null() {
            let e = &*cur;
            if e.dev == dev && e.ino == ino && e.offset == offset {
                return cur;
            }
            cur = e.next;
        }
    }
    ptr::null_mut()
}

fn insert(tab: &mut PcacheTab, entry: *mut CachedPage) {
    unsafe {
        let b = bucket_of((*entry).dev, (*entry).ino, (*entry).offset);
        (*entry).next = tab.buckets[b];
        tab.buckets[b] = entry;
    }
}

fn unlink_entry(tab: &mut PcacheTab, entry: *mut CachedPage) {
    unsafe {
        let b = bucket_of((*entry).dev, (*entry).ino, (*entry).offset);
        let mut cur = tab.buckets[b];
        let mut prev: *mut CachedPage = ptr::null_mut();
        while !cur.is_null() {
            if cur == entry {
                if prev.is_null() {
                    tab.buckets[b] = (*cur).next;
                } else {
                    (*prev).next = (*cur).next;
                }
                return;
            }
            prev = cur;
            cur = (*cur).next;
        }
    }
}

fn current_pid() -> u32 {
    services::current_task_id()
}

/// Tear down an entry whose frame has no extra shares. The frame must be
/// at exactly one share (the entry's own) — anything else means a caller
/// is still mapping it, and freeing underneath them would be memory
/// corruption, so we die loudly instead.
fn release_page_memory(entry: *mut CachedPage) {
    unsafe {
        let e = &mut *entry;
        if !e.phys.is_null() {
            if get_frame_shares(e.phys) != 1 {
                klog_error!(
                    "pcache: wrong refs on page dev {:#x}, ino {:#x}, flags {:#x}, pid {}",
                    e.dev,
                    e.ino,
                    e.flags(),
                    e.pid
                );
                panic!("pcache: releasing a shared frame");
            }
            free_page_frame(e.phys);
            e.phys = PhysAddr::NULL;
        }

        if !e.node.is_null() {
            let node = e.node;
            e.node = ptr::null_mut();
            // Avoid deadlocking against ourselves: releasing the node may
            // write it back through bmap, which needs the node lock we may
            // already hold on this path.
            if (*node).lock.held_by_current() {
                (*node).lock.unlock();
                release_node(node);
                (*node).lock.lock();
            } else {
                release_node(node);
            }
        }

        kfree(entry as *mut u8);
    }
}

/// Remove a half-built or condemned entry the caller still holds BUSY.
/// If other holders appeared meanwhile, removal is postponed: the entry is
/// simply released and a later sweep will catch it.
fn free_cached_page(entry: *mut CachedPage) {
    let postponed = {
        let mut tab = PCACHE.lock();
        let e = unsafe { &*entry };
        if !e.phys.is_null() && get_frame_shares(e.phys) > 1 {
            e.clear_flags(PCACHE_FLAG_BUSY);
            true
        } else {
            unlink_entry(&mut tab, entry);
            false
        }
    };
    if postponed {
        klog_warn!("pcache: postponing page removal");
        return;
    }
    release_page_memory(entry);
}

// ---------------------------------------------------------------------------
// Fill and writeback
// ---------------------------------------------------------------------------

/// Translate the page's logical blocks, coalescing consecutive disk blocks
/// into as few strategy calls as possible. Returns bytes transferred.
fn run_coalesced(
    dev: DevId,
    disk_blocks: &[u64],
    buf: *mut u8,
    block_size: usize,
    write: bool,
) -> KResult<usize> {
    let n = disk_blocks.len();
    let mut done = 0usize;
    let mut i = 0usize;

    while i < n {
        let p = unsafe { buf.add(i * block_size) };

        if disk_blocks[i] == 0 {
            // Hole: reads see zeros, writes skip.
            if !write {
                unsafe { ptr::write_bytes(p, 0, block_size) };
            }
            done += block_size;
            i += 1;
            continue;
        }

        // Consecutive disk blocks go out as one request.
        let mut run = 1usize;
        while i + run < n && disk_blocks[i + run] == disk_blocks[i] + run as u64 {
            run += 1;
        }

        let mut req = DiskReq {
            dev,
            data: p,
            datasz: block_size * run,
            fs_blocksz: block_size,
            blockno: disk_blocks[i],
            write,
        };
        if bdev_strategy(&mut req) < 0 {
            return if done == 0 { Err(Errno::EIO) } else { Ok(done) };
        }
        done += block_size * run;
        i += run;
    }
    Ok(done)
}

const MAX_BLOCKS_PER_PAGE: usize = (PAGE_SIZE as usize) / 512;

fn fill_file_page(entry: *mut CachedPage, flags: u32) -> KResult<usize> {
    let e = unsafe { &mut *entry };
    let minfo = get_mount_info(e.dev);
    if minfo.is_null() {
        klog_error!("pcache: reading from unmounted device {:#x}", e.dev);
        return Err(Errno::ENODEV);
    }
    let m = unsafe { &*minfo };
    let bsz = m.block_size;
    if bsz == 0 || bsz as u64 > PAGE_SIZE {
        panic!("pcache: device block size unusable");
    }

    // Check the disk has room for a later writeback before caching a page
    // we might dirty. Read-only filesystems skip the check.
    if !m.readonly() {
        if let Some(ops) = m.fs_ops {
            let mut ubuf = FsUstat::default();
            if ops.ustat(minfo, &mut ubuf).is_ok() && (ubuf.f_tfree as usize) < (PAGE_SIZE as usize / bsz)
            {
                klog_error!("pcache: device {:#x} has no space left", e.dev);
                return Err(Errno::ENOSPC);
            }
        }
    }

    let node = e.node;
    let nblocks = PAGE_SIZE as usize / bsz;
    let first_block = e.offset / bsz as u64;
    let bmap_flag = if flags & PCACHE_AUTO_ALLOC != 0 {
        BmapFlag::Create
    } else {
        BmapFlag::None
    };

    let mut disk_blocks = [0u64; MAX_BLOCKS_PER_PAGE];
    {
        let n = unsafe { &*node };
        let ops = n.ops.ok_or(Errno::ENODEV)?;
        let _g = n.lock.guard();
        for (i, b) in disk_blocks.iter_mut().take(nblocks).enumerate() {
            *b = ops.bmap(node, first_block + i as u64, bsz, bmap_flag);
        }
    }

    let res = run_coalesced(e.dev, &disk_blocks[..nblocks], e.virt, bsz, false)?;
    e.len = PAGE_SIZE as usize;
    Ok(res)
}

fn fill_block_page(entry: *mut CachedPage) -> KResult<usize> {
    let e = unsafe { &mut *entry };
    let minfo = get_mount_info(e.dev);
    if minfo.is_null() {
        klog_error!("pcache: reading from unmounted device {:#x}", e.dev);
        return Err(Errno::ENODEV);
    }
    let bsz = unsafe { (*minfo).block_size };
    if bsz == 0 || bsz as u64 > PAGE_SIZE {
        panic!("pcache: device block size unusable");
    }

    let mut req = DiskReq {
        dev: e.dev,
        data: e.virt,
        datasz: bsz,
        fs_blocksz: bsz,
        blockno: e.offset,
        write: false,
    };
    if bdev_strategy(&mut req) < 0 {
        return Err(Errno::EIO);
    }
    e.len = bsz;
    Ok(bsz)
}

fn get_cached_internal(
    dev: DevId,
    ino: InodeId,
    node: *mut Node,
    offset: u64,
    flags: u32,
) -> *mut CachedPage {
    let mut stale_tries = 0u32;
    let mut busy_tries = 0u32;

    loop {
        let mut tab = PCACHE.lock();
        let existing = lookup(&tab, dev, ino, offset);

        if !existing.is_null() {
            let e = unsafe { &*existing };

            if e.flags() & PCACHE_FLAG_STALE != 0 {
                drop(tab);
                remove_stale_cached_pages();
                if flags & PCACHE_IGNORE_STALE != 0 {
                    return ptr::null_mut();
                }
                stale_tries += 1;
                if stale_tries >= STALE_RETRY_LIMIT {
                    klog_error!(
                        "pcache: stale page dev {:#x}, ino {:#x}, flags {:#x}, pid {}",
                        dev,
                        ino,
                        e.flags(),
                        e.pid
                    );
                    panic!("pcache: stale page cannot be reclaimed");
                }
                services::block_on(existing as usize, false, 1);
                continue;
            }

            if e.flags() & PCACHE_FLAG_BUSY != 0 {
                e.set_flags(PCACHE_FLAG_WANTED);
                drop(tab);
                busy_tries += 1;
                if busy_tries >= BUSY_RETRY_LIMIT {
                    klog_error!(
                        "pcache: busy page dev {:#x}, ino {:#x}, flags {:#x}, pid {}",
                        dev,
                        ino,
                        e.flags(),
                        e.pid
                    );
                    panic!("pcache: busy page never released");
                }
                services::block_on(existing as usize, false, BUSY_SLEEP_TICKS);
                continue;
            }

            e.set_flags(PCACHE_FLAG_BUSY);
            inc_frame_shares(e.phys);
            unsafe {
                (*existing).last_accessed = ticks();
                (*existing).pid = current_pid();
            }
            return existing;
        }

        if flags & PCACHE_PEEK_ONLY != 0 {
            return ptr::null_mut();
        }

        // Miss: insert a BUSY placeholder, then fill outside the lock.
        let entry = kmalloc_zeroed(core::mem::size_of::<CachedPage>()) as *mut CachedPage;
        if entry.is_null() {
            panic!("pcache: cannot allocate page cache entry");
        }
        unsafe {
            let e = &mut *entry;
            e.dev = dev;
            e.ino = ino;
            e.offset = offset;
            e.pid = current_pid();
            e.flags = AtomicU32::new(PCACHE_FLAG_BUSY);
            if ino != PCACHE_NOINODE {
                e.node = node;
                (*node).refs.fetch_add(1, Ordering::AcqRel);
            }
        }
        insert(&mut tab, entry);
        drop(tab);

        let phys = alloc_page_frame(0);
        if phys.is_null() {
            panic!("pcache: failed to allocate page frame");
        }
        unsafe {
            let e = &mut *entry;
            e.phys = phys;
            e.virt = frame_virt(phys);
        }

        let res = if ino == PCACHE_NOINODE {
            fill_block_page(entry)
        } else {
            fill_file_page(entry, flags)
        };

        let read = match res {
            Ok(n) => n,
            Err(_) => {
                free_cached_page(entry);
                return ptr::null_mut();
            }
        };

        unsafe {
            let e = &mut *entry;
            if read < e.len {
                ptr::write_bytes(e.virt.add(read), 0, e.len - read);
            }
            // The caller's share, on top of the entry's own.
            inc_frame_shares(e.phys);
            e.last_accessed = ticks();
        }
        return entry;
    }
}

// ---------------------------------------------------------------------------
// Public operations
// ---------------------------------------------------------------------------

/// Acquire the cached page of `node` covering `offset` (aligned down to a
/// page boundary). The entry comes back `BUSY` with the frame's share
/// count bumped for the caller. Null on failure (or a missing page with
/// `PCACHE_PEEK_ONLY`).
pub fn get_cached_page(node: *mut Node, offset: u64, flags: u32) -> *mut CachedPage {
    if node.is_null() {
        return ptr::null_mut();
    }
    let (dev, ino) = unsafe { ((*node).dev, (*node).inode) };
    get_cached_internal(dev, ino, node, offset & !(PAGE_SIZE - 1), flags)
}

/// Acquire a raw device block (the offset is a block number).
pub fn get_cached_block(dev: DevId, blockno: u64, flags: u32) -> *mut CachedPage {
    get_cached_internal(dev, PCACHE_NOINODE, ptr::null_mut(), blockno, flags)
}

/// Release a page acquired with `get_cached_page`/`get_cached_block`:
/// clear BUSY and WANTED, drop the caller's frame share, wake sleepers.
pub fn release_cached_page(entry: *mut CachedPage) {
    if entry.is_null() {
        return;
    }
    let wanted = {
        let _tab = PCACHE.lock();
        let e = unsafe { &*entry };
        let wanted = e.flags() & PCACHE_FLAG_WANTED != 0;
        e.clear_flags(PCACHE_FLAG_BUSY | PCACHE_FLAG_WANTED);
        dec_frame_shares(e.phys);
        wanted
    };
    if wanted {
        services::unblock_all(entry as usize);
    }
}

/// Mark an entry dirty (the write paths call this after touching the page).
pub fn mark_cached_page_dirty(entry: *mut CachedPage) {
    if !entry.is_null() {
        unsafe { (*entry).set_flags(PCACHE_FLAG_DIRTY) };
    }
}

/// Mark an entry permanently dirty: every sweep re-arms DIRTY. Used for
/// shared writable mappings, whose pages can be dirtied behind the
/// kernel's back.
pub fn mark_cached_page_always_dirty(entry: *mut CachedPage) {
    if !entry.is_null() {
        unsafe { (*entry).set_flags(PCACHE_FLAG_ALWAYS_DIRTY) };
    }
}

/// Like `release_cached_page` but keeps the caller's frame share — used
/// when the frame has been handed to a page table and must stay counted.
pub fn release_cached_page_keep_share(entry: *mut CachedPage) {
    if entry.is_null() {
        return;
    }
    let wanted = {
        let _tab = PCACHE.lock();
        let e = unsafe { &*entry };
        let wanted = e.flags() & PCACHE_FLAG_WANTED != 0;
        e.clear_flags(PCACHE_FLAG_BUSY | PCACHE_FLAG_WANTED);
        wanted
    };
    if wanted {
        services::unblock_all(entry as usize);
    }
}

/// Write a cached page back to disk. Returns bytes written; 0 (without
/// error) on read-only mounts. `EAGAIN` means the current task already
/// holds the node lock and the flush must be retried by a later sweep.
/// Driver failure is `EIO` and condemns nothing by itself — the sweep that
/// called us decides to mark the entry stale.
pub fn sync_cached_page(entry: *mut CachedPage) -> KResult<usize> {
    let e = unsafe { &mut *entry };
    let minfo = get_mount_info(e.dev);
    if minfo.is_null() {
        klog_error!("pcache: writing to unmounted device {:#x}", e.dev);
        return Err(Errno::EIO);
    }
    let m = unsafe { &*minfo };
    if m.readonly() {
        return Ok(0);
    }
    let bsz = m.block_size;

    if e.ino == PCACHE_NOINODE {
        if e.flags() & PCACHE_FLAG_STALE != 0 {
            return Err(Errno::EIO);
        }
        let mut req = DiskReq {
            dev: e.dev,
            data: e.virt,
            datasz: e.len,
            fs_blocksz: e.len,
            blockno: e.offset,
            write: true,
        };
        if bdev_strategy(&mut req) < 0 {
            return Err(Errno::EIO);
        }
        return Ok(e.len);
    }

    let node = e.node;
    if node.is_null() {
        return Err(Errno::EIO);
    }
    let n = unsafe { &*node };
    if n.refs.load(Ordering::Acquire) == 0 {
        klog_error!(
            "pcache: page with zero node refs (dev {:#x}, ino {:#x})",
            e.dev,
            e.ino
        );
        panic!("pcache: page outlived its node");
    }

    // A recursive node-lock acquisition would deadlock against ourselves;
    // report EAGAIN so the sweep marks the page ALWAYS_DIRTY and retries.
    if n.lock.held_by_current() {
        return Err(Errno::EAGAIN);
    }

    let ops = n.ops.ok_or(Errno::EIO)?;
    let nblocks = e.len / bsz;
    let first_block = e.offset / bsz as u64;
    let mut disk_blocks = [0u64; MAX_BLOCKS_PER_PAGE];
    {
        let _g = n.lock.guard();
        let mut off = e.offset;
        for (i, b) in disk_blocks.iter_mut().take(nblocks).enumerate() {
            // Only allocate blocks that are still inside the file.
            let flag = if off < n.size {
                BmapFlag::Create
            } else {
                BmapFlag::None
            };
            *b = ops.bmap(node, first_block + i as u64, bsz, flag);
            off += bsz as u64;
        }
    }

    run_coalesced(e.dev, &disk_blocks[..nblocks], e.virt, bsz, true)
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

fn maj_matches(filter: Option<u32>, dev: DevId) -> bool {
    match filter {
        None => true,
        Some(maj) => major(dev) == maj,
    }
}

/// Re-arm DIRTY on every ALWAYS_DIRTY entry.
fn mark_dirty_pages(maj: Option<u32>) {
    let tab = PCACHE.lock();
    for b in tab.buckets.iter() {
        let mut cur = *b;
        unsafe {
            while !cur.is_null() {
                let e = &*cur;
                if maj_matches(maj, e.dev) && e.flags() & PCACHE_FLAG_ALWAYS_DIRTY != 0 {
                    e.set_flags(PCACHE_FLAG_DIRTY);
                }
                cur = e.next;
            }
        }
    }
}

/// Flush every DIRTY entry. The table lock is dropped around each flush
/// and the bucket rescanned from the top afterwards.
fn flush_dirty_pages(maj: Option<u32>) {
    let me = current_pid();
    let mut tab = PCACHE.lock();

    for bi in 0..PCACHE_BUCKETS {
        'bucket: loop {
            let mut cur = tab.buckets[bi];
            unsafe {
                while !cur.is_null() {
                    let e = &*cur;
                    if !maj_matches(maj, e.dev) || e.flags() & PCACHE_FLAG_DIRTY == 0 {
                        cur = e.next;
                        continue;
                    }

                    if e.flags() & PCACHE_FLAG_BUSY != 0 && e.pid != me {
                        e.set_flags(PCACHE_FLAG_WANTED);
                        drop(tab);
                        services::block_on(cur as usize, false, FLUSH_SLEEP_TICKS);
                        tab = PCACHE.lock();
                        continue 'bucket;
                    }

                    e.set_flags(PCACHE_FLAG_BUSY);
                    e.clear_flags(PCACHE_FLAG_DIRTY);
                    (*cur).pid = u32::MAX;
                    (*cur).last_accessed = ticks();

                    drop(tab);
                    let res = sync_cached_page(cur);
                    tab = PCACHE.lock();

                    let wanted = e.flags() & PCACHE_FLAG_WANTED != 0;
                    e.clear_flags(PCACHE_FLAG_BUSY | PCACHE_FLAG_WANTED);

                    match res {
                        // Node locked by us further up the stack: leave the
                        // page for a later sweep instead of looping on it.
                        Err(Errno::EAGAIN) => e.set_flags(PCACHE_FLAG_ALWAYS_DIRTY),
                        Err(_) => e.set_flags(PCACHE_FLAG_STALE),
                        Ok(_) => {}
                    }

                    if wanted {
                        services::unblock_all(cur as usize);
                    }
                    continue 'bucket;
                }
            }
            break;
        }
    }
}

/// Shared eviction walk: for every entry passing `want` whose flags and
/// share count permit eviction, release it. Entries passing `want` but not
/// evictable make the sweep report `EBUSY` when `condemn` is set.
fn sweep_evict(
    want: &mut dyn FnMut(&CachedPage) -> bool,
    skip_flags: u32,
    condemn: bool,
) -> KResult<()> {
    let mut res = Ok(());
    let mut tab = PCACHE.lock();

    for bi in 0..PCACHE_BUCKETS {
        'bucket: loop {
            let mut cur = tab.buckets[bi];
            unsafe {
                while !cur.is_null() {
                    let e = &*cur;
                    let next = e.next;
                    if want(e) {
                        if condemn {
                            e.set_flags(PCACHE_FLAG_STALE);
                        }
                        if e.flags() & skip_flags == 0 && get_frame_shares(e.phys) <= 1 {
                            unlink_entry(&mut tab, cur);
                            drop(tab);
                            release_page_memory(cur);
                            tab = PCACHE.lock();
                            continue 'bucket;
                        }
                        if condemn {
                            res = Err(Errno::EBUSY);
                        }
                    }
                    cur = next;
                }
            }
            break;
        }
    }
    res
}

/// Flush dirty pages, then evict entries untouched for `older_than_ticks`
/// whose frames have no extra shares.
pub fn remove_old_cached_pages(maj: Option<u32>, older_than_ticks: u64) {
    mark_dirty_pages(maj);
    flush_dirty_pages(maj);

    let now = ticks();
    if now <= older_than_ticks {
        return;
    }
    let older_than = now - older_than_ticks;

    let _ = sweep_evict(
        &mut |e| maj_matches(maj, e.dev) && e.last_accessed < older_than,
        PCACHE_FLAG_BUSY | PCACHE_FLAG_WANTED | PCACHE_FLAG_DIRTY,
        false,
    );
}

/// Evict every STALE entry that is not held.
pub fn remove_stale_cached_pages() {
    let _ = sweep_evict(
        &mut |e| e.flags() & PCACHE_FLAG_STALE != 0,
        PCACHE_FLAG_BUSY | PCACHE_FLAG_WANTED,
        false,
    );
}

/// Flush, then evict every unreferenced entry (of `node`, or all).
pub fn remove_unreferenced_cached_pages(node: *mut Node) {
    mark_dirty_pages(None);
    flush_dirty_pages(None);

    let (dev, ino) = if node.is_null() {
        (0, 0)
    } else {
        unsafe { ((*node).dev, (*node).inode) }
    };

    let _ = sweep_evict(
        &mut |e| node.is_null() || (e.dev == dev && e.ino == ino),
        PCACHE_FLAG_BUSY | PCACHE_FLAG_WANTED | PCACHE_FLAG_DIRTY,
        false,
    );
}

/// Condemn and evict every page of a device (unmount). `EBUSY` when pages
/// had to stay behind; they are stale and will be reclaimed on release.
pub fn remove_cached_disk_pages(dev: DevId) -> KResult<()> {
    sweep_evict(
        &mut |e| e.dev == dev,
        PCACHE_FLAG_BUSY | PCACHE_FLAG_WANTED,
        true,
    )
}

/// Condemn and evict every page of one node (unlink/truncate).
pub fn remove_cached_node_pages(node: *mut Node) -> KResult<()> {
    if node.is_null() {
        return Err(Errno::EINVAL);
    }
    let (dev, ino) = unsafe { ((*node).dev, (*node).inode) };
    if dev == 0 || ino == 0 {
        return Err(Errno::EINVAL);
    }
    sweep_evict(
        &mut |e| e.dev == dev && e.ino == ino,
        PCACHE_FLAG_BUSY | PCACHE_FLAG_WANTED,
        true,
    )
}

/// The periodic flush entry point: re-arm ALWAYS_DIRTY pages, flush dirty
/// pages, reclaim old and stale entries.
pub fn flush_cached_pages(dev: Option<DevId>) {
    let maj = dev.map(major);
    remove_old_cached_pages(maj, TWO_MINUTES);
    remove_stale_cached_pages();
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

fn count_where(pred: &mut dyn FnMut(&CachedPage) -> bool) -> usize {
    let tab = PCACHE.lock();
    let mut count = 0;
    for b in tab.buckets.iter() {
        let mut cur = *b;
        unsafe {
            while !cur.is_null() {
                if pred(&*cur) {
                    count += 1;
                }
                cur = (*cur).next;
            }
        }
    }
    count
}

/// Cached file pages.
pub fn get_cached_page_count() -> usize {
    count_where(&mut |e| e.ino != PCACHE_NOINODE)
}

/// Cached raw disk blocks.
pub fn get_cached_block_count() -> usize {
    count_where(&mut |e| e.ino == PCACHE_NOINODE)
}

pub fn get_busy_cached_page_count() -> usize {
    count_where(&mut |e| e.flags() & PCACHE_FLAG_BUSY != 0)
}

pub fn get_dirty_cached_page_count() -> usize {
    count_where(&mut |e| e.flags() & PCACHE_FLAG_DIRTY != 0)
}

/// Number of cached pages belonging to `node`.
pub fn node_has_cached_pages(node: *mut Node) -> usize {
    if node.is_null() {
        return 0;
    }
    let (dev, ino) = unsafe { ((*node).dev, (*node).inode) };
    count_where(&mut |e| e.dev == dev && e.ino == ino)
}
