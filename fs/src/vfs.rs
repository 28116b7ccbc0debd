//! Generic VFS operations: open, file I/O through the page cache, and the
//! namespace mutations (link, unlink, mkdir, rmdir, rename, symlink).
//!
//! Everything here is filesystem-agnostic: directory structure is mutated
//! through the vtable, data moves through the page cache, and the only
//! policy applied locally is the Unix permission and mode logic.

use core::cmp::min;

use cinder_abi::addr::PAGE_SIZE;
use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{
    LINK_MAX, O_ACCMODE, O_APPEND, O_CREAT, O_DIRECTORY, O_EXCL, O_NOFOLLOW, O_PATH, O_RDONLY,
    O_RDWR, O_TRUNC, O_WRONLY, PERM_READ, PERM_WRITE, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, S_ISGID,
    S_ISVTX, UserStat, s_isdir, s_islnk, s_isreg,
};
use cinder_abi::signal::SIGXFSZ;
use cinder_lib::services;

use crate::fileio::{File, falloc};
use crate::fsops::DirentLoc;
use crate::mount::get_mount_info;
use crate::node::{
    FS_NODE_DIRTY, FS_NODE_MOUNTPOINT, Node, get_node, new_node, release_node, truncate_node,
    update_atime, update_mtime, write_node,
};
use crate::path::{
    FsContext, ParentDir, get_parent_dir, has_perm, lookup_last, put_parent_dir, vfs_lookup,
    wake_node_waiters,
};
use crate::pcache::{
    PCACHE_AUTO_ALLOC, get_cached_page, mark_cached_page_dirty, release_cached_page,
    remove_cached_node_pages,
};

// ---------------------------------------------------------------------------
// Generic file I/O
// ---------------------------------------------------------------------------

/// Read file data through the page cache into a kernel buffer.
pub fn vfs_read_node(node: *mut Node, pos: &mut u64, buf: &mut [u8]) -> KResult<usize> {
    let size = unsafe { (*node).size };
    if *pos >= size {
        return Ok(0);
    }

    let mut left = min(buf.len() as u64, size - *pos) as usize;
    let mut total = 0usize;

    while left > 0 {
        let page = get_cached_page(node, *pos, 0);
        if page.is_null() {
            if total > 0 {
                break;
            }
            return Err(Errno::EIO);
        }

        let page_off = (*pos % PAGE_SIZE) as usize;
        let chunk = min(left, PAGE_SIZE as usize - page_off);
        unsafe {
            core::ptr::copy_nonoverlapping(
                (*page).virt.add(page_off),
                buf.as_mut_ptr().add(total),
                chunk,
            );
        }
        release_cached_page(page);

        *pos += chunk as u64;
        total += chunk;
        left -= chunk;
    }

    update_atime(node);
    Ok(total)
}

/// Write a kernel buffer into the file through the page cache. Pages are
/// marked dirty; the file grows under the caller's file-size limit, and a
/// write clipped by the limit posts SIGXFSZ and fails with `EFBIG` after
/// filling the file up to exactly the limit.
pub fn vfs_write_node(node: *mut Node, pos: &mut u64, buf: &[u8]) -> KResult<usize> {
    let limit = services::current_fsize_limit();
    let mut clipped = false;

    let mut len = buf.len();
    if *pos >= limit {
        services::post_signal_current(SIGXFSZ, 0, 0);
        return Err(Errno::EFBIG);
    }
    if *pos + len as u64 > limit {
        len = (limit - *pos) as usize;
        clipped = true;
    }

    let mut total = 0usize;
    while total < len {
        let page = get_cached_page(node, *pos, PCACHE_AUTO_ALLOC);
        if page.is_null() {
            if total > 0 {
                break;
            }
            return Err(Errno::EIO);
        }

        let page_off = (*pos % PAGE_SIZE) as usize;
        let chunk = min(len - total, PAGE_SIZE as usize - page_off);
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr().add(total),
                (*page).virt.add(page_off),
                chunk,
            );
        }
        mark_cached_page_dirty(page);
        release_cached_page(page);

        *pos += chunk as u64;
        total += chunk;

        let n = unsafe { &mut *node };
        if *pos > n.size {
            n.size = *pos;
            n.set_flag(FS_NODE_DIRTY);
        }
    }

    update_mtime(node);

    if clipped {
        services::post_signal_current(SIGXFSZ, 0, 0);
        return Err(Errno::EFBIG);
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// open
// ---------------------------------------------------------------------------

fn access_bits_for(flags: u32) -> u32 {
    match flags & O_ACCMODE {
        O_RDONLY => PERM_READ,
        O_WRONLY => PERM_WRITE,
        O_RDWR => PERM_READ | PERM_WRITE,
        _ => PERM_READ,
    }
}

fn create_leaf(
    ctx: &FsContext,
    pd: &ParentDir,
    path: &[u8],
    mode: u32,
) -> KResult<*mut Node> {
    let parent = unsafe { &*pd.parent };
    if !has_perm(ctx, pd.parent, PERM_WRITE) {
        return Err(Errno::EACCES);
    }
    let ops = parent.ops.ok_or(Errno::ENODEV)?;

    let node = new_node(parent.dev)?;
    {
        let n = unsafe { &mut *node };
        n.mode = S_IFREG | (mode & 0o7777 & !ctx.umask);
        n.uid = ctx.uid;
        // SGID directories hand their group down to new files.
        n.gid = if parent.mode & S_ISGID != 0 {
            parent.gid
        } else {
            ctx.gid
        };
        n.links = 1;
        n.set_flag(FS_NODE_DIRTY);
    }
    update_mtime(node);

    let name = &path[pd.base_start..pd.base_start + pd.base_len];
    if let Err(e) = ops.addir(pd.parent, name, unsafe { (*node).inode }) {
        unsafe { (*node).links = 0 };
        release_node(node);
        return Err(e);
    }
    update_mtime(pd.parent);
    let _ = write_node(node);
    Ok(node)
}

/// Truncate an open target, condemning its cached pages first so racing
/// page-cache users discard rather than resurrect stale data.
fn truncate_for_open(node: *mut Node) -> KResult<()> {
    let _ = remove_cached_node_pages(node);
    truncate_node(node, 0)
}

/// Open (and possibly create) the file at `path`. Returns a referenced
/// file-table entry with the node's I/O entry points installed.
pub fn vfs_open(
    ctx: &FsContext,
    path: &[u8],
    flags: u32,
    mode: u32,
    start: *mut Node,
) -> KResult<*mut File> {
    let pd = get_parent_dir(ctx, path, start, true)?;

    let follow_symlink = flags & O_NOFOLLOW == 0;
    let node = match lookup_last(ctx, &pd, path, true, follow_symlink) {
        Ok(node) => {
            if flags & (O_CREAT | O_EXCL) == (O_CREAT | O_EXCL) {
                release_node(node);
                put_parent_dir(&pd);
                return Err(Errno::EEXIST);
            }
            node
        }
        Err(Errno::ENOENT) if flags & O_CREAT != 0 => {
            if pd.trailing_slash {
                put_parent_dir(&pd);
                return Err(Errno::EISDIR);
            }
            match create_leaf(ctx, &pd, path, mode) {
                Ok(n) => n,
                Err(e) => {
                    put_parent_dir(&pd);
                    return Err(e);
                }
            }
        }
        Err(e) => {
            put_parent_dir(&pd);
            return Err(e);
        }
    };
    put_parent_dir(&pd);

    let n = unsafe { &*node };

    if s_islnk(n.mode) {
        // Only reachable with O_NOFOLLOW.
        release_node(node);
        return Err(Errno::ELOOP);
    }

    if (pd.trailing_slash || flags & O_DIRECTORY != 0) && !n.is_dir() {
        release_node(node);
        return Err(Errno::ENOTDIR);
    }

    if flags & O_PATH == 0 {
        let want_write = matches!(flags & O_ACCMODE, O_WRONLY | O_RDWR);
        if n.is_dir() && want_write {
            release_node(node);
            return Err(Errno::EISDIR);
        }
        if !has_perm(ctx, node, access_bits_for(flags)) {
            release_node(node);
            return Err(Errno::EACCES);
        }

        if flags & O_TRUNC != 0 && want_write && s_isreg(n.mode) {
            if let Err(e) = truncate_for_open(node) {
                release_node(node);
                return Err(e);
            }
        }
    }

    let file = match falloc() {
        Ok(f) => f,
        Err(e) => {
            release_node(node);
            return Err(e);
        }
    };
    unsafe {
        (*file).flags = flags;
        (*file).node = node;
        (*file).pos = if flags & O_APPEND != 0 { (*node).size } else { 0 };
    }
    crate::dispatch::install_node_io(node, flags);
    Ok(file)
}

// ---------------------------------------------------------------------------
// Namespace operations
// ---------------------------------------------------------------------------

struct FoundLeaf {
    node: *mut Node,
    loc: DirentLoc,
}

/// Look the final component up and keep the dirent location for in-place
/// mutation. Both the node and the dirent page come back referenced.
fn find_leaf(pd: &ParentDir, path: &[u8]) -> KResult<FoundLeaf> {
    if pd.base_len == 0 {
        return Err(Errno::EBUSY);
    }
    let parent = unsafe { &*pd.parent };
    let ops = parent.ops.ok_or(Errno::ENODEV)?;
    let name = &path[pd.base_start..pd.base_start + pd.base_len];
    let loc = ops.finddir(pd.parent, name)?;
    match get_node(parent.dev, loc.ino, false) {
        Ok(node) => Ok(FoundLeaf { node, loc }),
        Err(e) => {
            release_cached_page(loc.page);
            Err(e)
        }
    }
}

fn sticky_rejects(ctx: &FsContext, parent: *mut Node, node: *mut Node) -> bool {
    let p = unsafe { &*parent };
    if p.mode & S_ISVTX == 0 || ctx.uid == 0 {
        return false;
    }
    let n = unsafe { &*node };
    ctx.uid != n.uid && ctx.uid != p.uid
}

/// Create a hard link to an existing file.
pub fn vfs_link(ctx: &FsContext, oldpath: &[u8], newpath: &[u8], follow: bool) -> KResult<()> {
    let old = vfs_lookup(ctx, oldpath, core::ptr::null_mut(), follow)?;
    let o = unsafe { &*old };

    if o.is_dir() {
        release_node(old);
        return Err(Errno::EPERM);
    }
    if o.links >= LINK_MAX {
        release_node(old);
        return Err(Errno::EMLINK);
    }

    let pd = match get_parent_dir(ctx, newpath, core::ptr::null_mut(), true) {
        Ok(pd) => pd,
        Err(e) => {
            release_node(old);
            return Err(e);
        }
    };

    let res = (|| {
        let parent = unsafe { &*pd.parent };
        if parent.dev != o.dev {
            return Err(Errno::EXDEV);
        }
        if !has_perm(ctx, pd.parent, PERM_WRITE) {
            return Err(Errno::EACCES);
        }
        if pd.base_len == 0 {
            return Err(Errno::EEXIST);
        }
        let name = &newpath[pd.base_start..pd.base_start + pd.base_len];
        let ops = parent.ops.ok_or(Errno::ENODEV)?;
        if ops.finddir(pd.parent, name).is_ok_and(|l| {
            release_cached_page(l.page);
            true
        }) {
            return Err(Errno::EEXIST);
        }
        ops.addir(pd.parent, name, o.inode)?;
        let om = unsafe { &mut *old };
        om.links += 1;
        om.set_flag(FS_NODE_DIRTY);
        update_mtime(pd.parent);
        Ok(())
    })();

    put_parent_dir(&pd);
    release_node(old);
    res
}

fn unlink_leaf(ctx: &FsContext, pd: &ParentDir, path: &[u8]) -> KResult<()> {
    if !has_perm(ctx, pd.parent, PERM_WRITE) {
        return Err(Errno::EACCES);
    }

    let leaf = find_leaf(pd, path)?;
    let res = (|| {
        let n = unsafe { &*leaf.node };
        if n.is_dir() {
            return Err(Errno::EISDIR);
        }
        if sticky_rejects(ctx, pd.parent, leaf.node) {
            return Err(Errno::EPERM);
        }

        let parent = unsafe { &*pd.parent };
        let ops = parent.ops.ok_or(Errno::ENODEV)?;
        ops.deldir(pd.parent, &leaf.loc, false)?;

        let nm = unsafe { &mut *leaf.node };
        if nm.links > 0 {
            nm.links -= 1;
        }
        nm.ctime = cinder_lib::clock::ticks();
        nm.set_flag(FS_NODE_DIRTY);
        update_mtime(pd.parent);
        Ok(())
    })();

    release_cached_page(leaf.loc.page);
    wake_node_waiters(leaf.node);
    release_node(leaf.node);
    res
}

fn rmdir_leaf(ctx: &FsContext, pd: &ParentDir, path: &[u8]) -> KResult<()> {
    if !has_perm(ctx, pd.parent, PERM_WRITE) {
        return Err(Errno::EACCES);
    }

    let leaf = find_leaf(pd, path)?;
    let res = (|| {
        let n = unsafe { &*leaf.node };
        if !n.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if n.has_flag(FS_NODE_MOUNTPOINT) {
            return Err(Errno::EBUSY);
        }
        if leaf.loc.name_bytes() == b"." || leaf.loc.name_bytes() == b".." {
            return Err(Errno::EINVAL);
        }
        if sticky_rejects(ctx, pd.parent, leaf.node) {
            return Err(Errno::EPERM);
        }

        let parent = unsafe { &*pd.parent };
        let ops = parent.ops.ok_or(Errno::ENODEV)?;
        if !ops.dir_empty(leaf.node) {
            return Err(Errno::ENOTEMPTY);
        }
        ops.deldir(pd.parent, &leaf.loc, false)?;

        let nm = unsafe { &mut *leaf.node };
        nm.links = 0;
        nm.set_flag(FS_NODE_DIRTY);

        // The removed directory's ".." no longer pins the parent.
        let pm = unsafe { &mut *pd.parent };
        if pm.links > 0 {
            pm.links -= 1;
        }
        pm.set_flag(FS_NODE_DIRTY);
        update_mtime(pd.parent);
        Ok(())
    })();

    release_cached_page(leaf.loc.page);
    release_node(leaf.node);
    res
}

/// Remove a directory entry; with `remove_dir` set this is rmdir.
pub fn vfs_unlink(ctx: &FsContext, path: &[u8], remove_dir: bool, start: *mut Node) -> KResult<()> {
    let pd = get_parent_dir(ctx, path, start, true)?;
    let res = if remove_dir {
        rmdir_leaf(ctx, &pd, path)
    } else {
        unlink_leaf(ctx, &pd, path)
    };
    put_parent_dir(&pd);
    res
}

/// Create a directory.
pub fn vfs_mkdir(ctx: &FsContext, path: &[u8], mode: u32, start: *mut Node) -> KResult<()> {
    let pd = get_parent_dir(ctx, path, start, true)?;

    let res = (|| {
        if pd.base_len == 0 {
            return Err(Errno::EEXIST);
        }
        if !has_perm(ctx, pd.parent, PERM_WRITE) {
            return Err(Errno::EACCES);
        }
        let parent = unsafe { &*pd.parent };
        let ops = parent.ops.ok_or(Errno::ENODEV)?;
        let name = &path[pd.base_start..pd.base_start + pd.base_len];

        if ops.finddir(pd.parent, name).is_ok_and(|l| {
            release_cached_page(l.page);
            true
        }) {
            return Err(Errno::EEXIST);
        }

        let node = new_node(parent.dev)?;
        {
            let n = unsafe { &mut *node };
            n.mode = S_IFDIR | (mode & 0o7777 & !ctx.umask);
            n.uid = ctx.uid;
            n.gid = if parent.mode & S_ISGID != 0 {
                parent.gid
            } else {
                ctx.gid
            };
            n.links = 2;
            n.set_flag(FS_NODE_DIRTY);
        }

        if let Err(e) = ops.mkdir(node, parent.inode) {
            unsafe { (*node).links = 0 };
            release_node(node);
            return Err(e);
        }
        if let Err(e) = ops.addir(pd.parent, name, unsafe { (*node).inode }) {
            unsafe { (*node).links = 0 };
            release_node(node);
            return Err(e);
        }

        // The child's ".." adds a link to the parent.
        let pm = unsafe { &mut *pd.parent };
        pm.links += 1;
        pm.set_flag(FS_NODE_DIRTY);
        update_mtime(pd.parent);

        let _ = write_node(node);
        release_node(node);
        Ok(())
    })();

    put_parent_dir(&pd);
    res
}

/// Rename. Link-then-unlink with the "don't decrement directory counts"
/// flag threaded down to `deldir` for the directory case. Dirent pages are
/// never held across another directory operation: the old entry is looked
/// up again for deletion, since the source and destination may share a
/// directory page.
pub fn vfs_rename(ctx: &FsContext, oldpath: &[u8], newpath: &[u8]) -> KResult<()> {
    let old_pd = get_parent_dir(ctx, oldpath, core::ptr::null_mut(), true)?;

    // Identify the source; keep the node referenced but drop its dirent
    // page immediately.
    let (node, old_name, old_name_len) = {
        let leaf = match find_leaf(&old_pd, oldpath) {
            Ok(l) => l,
            Err(e) => {
                put_parent_dir(&old_pd);
                return Err(e);
            }
        };
        let name = leaf.loc.name;
        let name_len = leaf.loc.name_len;
        release_cached_page(leaf.loc.page);
        (leaf.node, name, name_len)
    };

    let res = (|| {
        if !has_perm(ctx, old_pd.parent, PERM_WRITE) {
            return Err(Errno::EACCES);
        }
        if sticky_rejects(ctx, old_pd.parent, node) {
            return Err(Errno::EPERM);
        }

        let moving_dir = unsafe { (*node).is_dir() };
        if unsafe { (*node).has_flag(FS_NODE_MOUNTPOINT) } {
            return Err(Errno::EBUSY);
        }

        let new_pd = get_parent_dir(ctx, newpath, core::ptr::null_mut(), true)?;
        let inner = (|| {
            if new_pd.base_len == 0 {
                return Err(Errno::EEXIST);
            }
            let new_parent = unsafe { &*new_pd.parent };
            if new_parent.dev != unsafe { (*node).dev } {
                return Err(Errno::EXDEV);
            }
            if !has_perm(ctx, new_pd.parent, PERM_WRITE) {
                return Err(Errno::EACCES);
            }
            let ops = new_parent.ops.ok_or(Errno::ENODEV)?;
            let new_name = &newpath[new_pd.base_start..new_pd.base_start + new_pd.base_len];

            // An existing target is replaced: empty-directory for a
            // directory, plain unlink for a file.
            if let Ok(existing) = find_leaf(&new_pd, newpath) {
                let same = existing.node == node;
                let check = (|| {
                    if same {
                        return Ok(());
                    }
                    let e = unsafe { &*existing.node };
                    if moving_dir != e.is_dir() {
                        return Err(if moving_dir {
                            Errno::ENOTDIR
                        } else {
                            Errno::EISDIR
                        });
                    }
                    Ok(())
                })();
                if let Err(e) = check {
                    release_cached_page(existing.loc.page);
                    release_node(existing.node);
                    return Err(e);
                }
                if same {
                    release_cached_page(existing.loc.page);
                    release_node(existing.node);
                    return Ok(());
                }
                let is_dir = unsafe { (*existing.node).is_dir() };
                release_cached_page(existing.loc.page);
                if is_dir && !ops.dir_empty(existing.node) {
                    release_node(existing.node);
                    return Err(Errno::ENOTEMPTY);
                }
                // Delete with a fresh lookup so no page is held over it.
                let loc = ops.finddir(new_pd.parent, new_name)?;
                let del = ops.deldir(new_pd.parent, &loc, false);
                release_cached_page(loc.page);
                del?;
                let em = unsafe { &mut *existing.node };
                em.links = if is_dir { 0 } else { em.links.saturating_sub(1) };
                em.set_flag(FS_NODE_DIRTY);
                release_node(existing.node);
            }

            ops.addir(new_pd.parent, new_name, unsafe { (*node).inode })?;

            let old_parent = unsafe { &*old_pd.parent };
            let old_ops = old_parent.ops.ok_or(Errno::ENODEV)?;
            let loc = old_ops.finddir(old_pd.parent, &old_name[..old_name_len])?;
            // The group's on-disk count moves with the entry; deldir must
            // not decrement it.
            let del = old_ops.deldir(old_pd.parent, &loc, moving_dir);
            release_cached_page(loc.page);
            del?;

            if moving_dir && old_pd.parent != new_pd.parent {
                // The moved directory's ".." pins the new parent now.
                let opm = unsafe { &mut *old_pd.parent };
                if opm.links > 0 {
                    opm.links -= 1;
                }
                opm.set_flag(FS_NODE_DIRTY);
                let npm = unsafe { &mut *new_pd.parent };
                npm.links += 1;
                npm.set_flag(FS_NODE_DIRTY);

                if let Some(dops) = unsafe { (*node).ops } {
                    if let Ok(loc) = dops.finddir(node, b"..") {
                        let del = dops.deldir(node, &loc, true);
                        release_cached_page(loc.page);
                        if del.is_ok() {
                            let _ = dops.addir(node, b"..", new_parent.inode);
                        }
                    }
                }
            }

            update_mtime(old_pd.parent);
            update_mtime(new_pd.parent);
            Ok(())
        })();
        put_parent_dir(&new_pd);
        inner
    })();

    release_node(node);
    put_parent_dir(&old_pd);
    res
}

/// Create a symbolic link.
pub fn vfs_symlink(ctx: &FsContext, target: &[u8], linkpath: &[u8]) -> KResult<()> {
    let pd = get_parent_dir(ctx, linkpath, core::ptr::null_mut(), true)?;

    let res = (|| {
        if pd.base_len == 0 {
            return Err(Errno::EEXIST);
        }
        if !has_perm(ctx, pd.parent, PERM_WRITE) {
            return Err(Errno::EACCES);
        }
        let parent = unsafe { &*pd.parent };
        let ops = parent.ops.ok_or(Errno::ENODEV)?;
        let name = &linkpath[pd.base_start..pd.base_start + pd.base_len];

        if ops.finddir(pd.parent, name).is_ok_and(|l| {
            release_cached_page(l.page);
            true
        }) {
            return Err(Errno::EEXIST);
        }

        let node = new_node(parent.dev)?;
        {
            let n = unsafe { &mut *node };
            n.mode = S_IFLNK | 0o777;
            n.uid = ctx.uid;
            n.gid = ctx.gid;
            n.links = 1;
            n.set_flag(FS_NODE_DIRTY);
        }
        if let Err(e) = ops.write_symlink(node, target) {
            unsafe { (*node).links = 0 };
            release_node(node);
            return Err(e);
        }
        if let Err(e) = ops.addir(pd.parent, name, unsafe { (*node).inode }) {
            unsafe { (*node).links = 0 };
            release_node(node);
            return Err(e);
        }
        update_mtime(pd.parent);
        let _ = write_node(node);
        release_node(node);
        Ok(())
    })();

    put_parent_dir(&pd);
    res
}

/// Read a symlink's target.
pub fn vfs_readlink(ctx: &FsContext, path: &[u8], buf: &mut [u8]) -> KResult<usize> {
    let node = vfs_lookup(ctx, path, core::ptr::null_mut(), false)?;
    let res = (|| {
        let n = unsafe { &*node };
        if !s_islnk(n.mode) {
            return Err(Errno::EINVAL);
        }
        let ops = n.ops.ok_or(Errno::ENODEV)?;
        ops.read_symlink(node, buf)
    })();
    release_node(node);
    res
}

/// Fill a `UserStat` from a node.
pub fn vfs_stat_node(node: *mut Node, st: &mut UserStat) {
    let n = unsafe { &*node };
    let blksize = {
        let minfo = get_mount_info(n.dev);
        if minfo.is_null() {
            512
        } else {
            unsafe { (*minfo).block_size as u64 }
        }
    };
    *st = UserStat {
        st_dev: n.dev as u64,
        st_ino: n.inode,
        st_mode: n.mode,
        st_nlink: n.links,
        st_uid: n.uid,
        st_gid: n.gid,
        st_rdev: if matches!(n.mode & S_IFMT, 0o020000 | 0o060000) {
            n.blocks[0]
        } else {
            0
        },
        st_size: n.size,
        st_blksize: blksize,
        st_blocks: n.size.div_ceil(512),
        st_atime: n.atime,
        st_mtime: n.mtime,
        st_ctime: n.ctime,
    };
}

/// Change mode bits (owner or root only).
pub fn vfs_chmod(ctx: &FsContext, node: *mut Node, mode: u32) -> KResult<()> {
    let n = unsafe { &mut *node };
    if ctx.uid != 0 && ctx.uid != n.uid {
        return Err(Errno::EPERM);
    }
    n.mode = (n.mode & S_IFMT) | (mode & 0o7777);
    n.ctime = cinder_lib::clock::ticks();
    n.set_flag(FS_NODE_DIRTY);
    Ok(())
}

/// Change ownership (root only, as we carry no supplementary groups here).
pub fn vfs_chown(ctx: &FsContext, node: *mut Node, uid: u32, gid: u32) -> KResult<()> {
    let n = unsafe { &mut *node };
    if ctx.uid != 0 {
        return Err(Errno::EPERM);
    }
    if uid != u32::MAX {
        n.uid = uid;
    }
    if gid != u32::MAX {
        n.gid = gid;
    }
    n.ctime = cinder_lib::clock::ticks();
    n.set_flag(FS_NODE_DIRTY);
    Ok(())
}

/// Directory iteration through the vtable.
pub fn vfs_getdents(node: *mut Node, pos: &mut u64, buf: &mut [u8]) -> KResult<usize> {
    let n = unsafe { &*node };
    if !n.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let ops = n.ops.ok_or(Errno::ENODEV)?;
    ops.getdents(node, pos, buf)
}

/// Check a node is a directory the caller can search (chdir/chroot).
pub fn vfs_check_dir_access(ctx: &FsContext, node: *mut Node) -> KResult<()> {
    let n = unsafe { &*node };
    if !n.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if !has_perm(ctx, node, cinder_abi::fs::PERM_EXEC) {
        return Err(Errno::EACCES);
    }
    Ok(())
}

/// Is this node a directory?
pub fn vfs_is_dir(node: *mut Node) -> bool {
    unsafe { s_isdir((*node).mode) }
}
