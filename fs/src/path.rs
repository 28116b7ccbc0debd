//! Pathname resolution.
//!
//! Component-at-a-time walk from the caller's root, cwd, or an explicit
//! start directory. Each step checks that the current node is a searchable
//! directory, looks the component up with `finddir`, follows mount points
//! downward and (for "..") upward, and chases symlinks with a recursion
//! budget of `MAXSYMLINKS`.

use core::ptr;

use cinder_abi::errno::{Errno, KResult};
use cinder_abi::fs::{MAXSYMLINKS, NAME_MAX, PATH_MAX, PERM_EXEC, PERM_READ, PERM_WRITE, s_islnk};
use cinder_lib::services;

use crate::mount::{cross_mount_up, system_root};
use crate::node::{Node, get_node, node_ref, release_node};
use crate::pcache::release_cached_page;

/// Credentials and name-space anchors for one resolution or permission
/// check. The task layer builds one of these from the calling task; tests
/// build them directly.
#[derive(Clone, Copy)]
pub struct FsContext {
    pub uid: u32,
    pub gid: u32,
    pub umask: u32,
    pub root: *mut Node,
    pub cwd: *mut Node,
}

impl FsContext {
    /// A root-credential context anchored at the system root.
    pub fn kernel() -> Self {
        let root = system_root();
        Self {
            uid: 0,
            gid: 0,
            umask: 0o022,
            root,
            cwd: root,
        }
    }
}

/// Classic Unix permission check against a node's mode bits. Root passes
/// everything except execute on a file with no execute bit at all.
pub fn has_perm(ctx: &FsContext, node: *mut Node, perm: u32) -> bool {
    let n = unsafe { &*node };

    if ctx.uid == 0 {
        if perm & PERM_EXEC != 0 && !n.is_dir() {
            return n.mode & 0o111 != 0;
        }
        return true;
    }

    let bits = if ctx.uid == n.uid {
        (n.mode >> 6) & 0o7
    } else if ctx.gid == n.gid {
        (n.mode >> 3) & 0o7
    } else {
        n.mode & 0o7
    };

    (perm & PERM_READ == 0 || bits & 0o4 != 0)
        && (perm & PERM_WRITE == 0 || bits & 0o2 != 0)
        && (perm & PERM_EXEC == 0 || bits & 0o1 != 0)
}

/// Result of `get_parent_dir`: the referenced parent directory, the index
/// range of the final component inside the caller's path, and whether the
/// path carried a trailing slash (so `open` can reject non-directories).
pub struct ParentDir {
    pub parent: *mut Node,
    pub base_start: usize,
    pub base_len: usize,
    pub trailing_slash: bool,
}

fn next_component(path: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut start = from;
    while start < path.len() && path[start] == b'/' {
        start += 1;
    }
    if start >= path.len() {
        return None;
    }
    let mut end = start;
    while end < path.len() && path[end] != b'/' {
        end += 1;
    }
    Some((start, end))
}

/// Step from `dir` across `name`, handling "." / ".." and mount edges.
/// Consumes the caller's reference on `dir` and returns a referenced node.
fn walk_one(
    ctx: &FsContext,
    dir: *mut Node,
    name: &[u8],
    follow_mpoints: bool,
) -> KResult<*mut Node> {
    if name == b"." {
        return Ok(dir);
    }

    let mut dir = dir;
    if name == b".." {
        // Leaving a mounted root goes through the mount point beneath it;
        // the caller's root is a hard ceiling.
        if dir == ctx.root {
            return Ok(dir);
        }
        let mpoint = cross_mount_up(dir);
        if !mpoint.is_null() {
            node_ref(mpoint);
            release_node(dir);
            dir = mpoint;
        }
    }

    let d = unsafe { &*dir };
    let ops = match d.ops {
        Some(o) => o,
        None => {
            release_node(dir);
            return Err(Errno::ENODEV);
        }
    };

    let loc = match ops.finddir(dir, name) {
        Ok(l) => l,
        Err(e) => {
            release_node(dir);
            return Err(e);
        }
    };
    let ino = loc.ino;
    release_cached_page(loc.page);

    let child = get_node(d.dev, ino, follow_mpoints);
    release_node(dir);
    child
}

struct Walk<'a> {
    ctx: &'a FsContext,
    link_depth: u32,
}

impl Walk<'_> {
    /// Resolve `path` to a referenced node. `start` is the directory for
    /// relative paths (cwd if null). With `follow_last` unset, a symlink in
    /// the final component is returned as-is.
    fn namei(&mut self, path: &[u8], start: *mut Node, follow_last: bool) -> KResult<*mut Node> {
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        if path.len() > PATH_MAX {
            return Err(Errno::ENAMETOOLONG);
        }

        let mut cur = if path[0] == b'/' {
            self.ctx.root
        } else if !start.is_null() {
            start
        } else {
            self.ctx.cwd
        };
        if cur.is_null() {
            return Err(Errno::ENOENT);
        }
        node_ref(cur);

        let mut pos = 0usize;
        while let Some((s, e)) = next_component(path, pos) {
            let name = &path[s..e];
            if name.len() > NAME_MAX {
                release_node(cur);
                return Err(Errno::ENAMETOOLONG);
            }

            let is_last = next_component(path, e).is_none();

            {
                let c = unsafe { &*cur };
                if !c.is_dir() {
                    release_node(cur);
                    return Err(Errno::ENOTDIR);
                }
                if !has_perm(self.ctx, cur, PERM_EXEC) {
                    release_node(cur);
                    return Err(Errno::EACCES);
                }
            }

            // walk_one consumes our reference on cur.
            let parent = cur;
            node_ref(parent);
            let child = match walk_one(self.ctx, cur, name, true) {
                Ok(c) => c,
                Err(e) => {
                    release_node(parent);
                    return Err(e);
                }
            };

            let child_is_link = unsafe { s_islnk((*child).mode) };
            let resolved = if child_is_link && (!is_last || follow_last) {
                match self.follow_symlink(child, parent) {
                    Ok(r) => r,
                    Err(e) => {
                        release_node(parent);
                        return Err(e);
                    }
                }
            } else {
                child
            };
            release_node(parent);

            cur = resolved;
            pos = e;
        }

        Ok(cur)
    }

    /// Chase one symlink. Consumes the reference on `link`; `parent` is the
    /// directory the link was found in (borrowed).
    fn follow_symlink(&mut self, link: *mut Node, parent: *mut Node) -> KResult<*mut Node> {
        if self.link_depth >= MAXSYMLINKS {
            release_node(link);
            return Err(Errno::ELOOP);
        }
        self.link_depth += 1;

        let mut target = [0u8; PATH_MAX];
        let len = {
            let l = unsafe { &*link };
            let ops = l.ops.ok_or(Errno::ENODEV);
            match ops {
                Ok(o) => match o.read_symlink(link, &mut target) {
                    Ok(len) => len,
                    Err(e) => {
                        release_node(link);
                        return Err(e);
                    }
                },
                Err(e) => {
                    release_node(link);
                    return Err(e);
                }
            }
        };
        release_node(link);

        self.namei(&target[..len], parent, true)
    }
}

/// Resolve a full pathname to a referenced node.
pub fn vfs_lookup(
    ctx: &FsContext,
    path: &[u8],
    start: *mut Node,
    follow_last: bool,
) -> KResult<*mut Node> {
    let mut walk = Walk { ctx, link_depth: 0 };
    walk.namei(path, start, follow_last)
}

/// Walk to the parent of the final component. Returns the referenced
/// parent plus the final component's position in `path`. An empty final
/// component ("/" alone) yields `base_len == 0`.
pub fn get_parent_dir(
    ctx: &FsContext,
    path: &[u8],
    start: *mut Node,
    follow_mpoints: bool,
) -> KResult<ParentDir> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    if path.len() > PATH_MAX {
        return Err(Errno::ENAMETOOLONG);
    }

    // Find the final component and remember the trailing slash.
    let mut end = path.len();
    let mut trailing_slash = false;
    while end > 0 && path[end - 1] == b'/' {
        end -= 1;
        trailing_slash = true;
    }
    if end == 0 {
        // "/" or "///": parent is the root itself.
        let root = ctx.root;
        if root.is_null() {
            return Err(Errno::ENOENT);
        }
        node_ref(root);
        return Ok(ParentDir {
            parent: root,
            base_start: 0,
            base_len: 0,
            trailing_slash: true,
        });
    }

    let mut base_start = end;
    while base_start > 0 && path[base_start - 1] != b'/' {
        base_start -= 1;
    }
    let base_len = end - base_start;
    if base_len > NAME_MAX {
        return Err(Errno::ENAMETOOLONG);
    }

    let parent = if base_start == 0 {
        // Single component, relative: parent is the start directory.
        let dir = if !start.is_null() { start } else { ctx.cwd };
        if dir.is_null() {
            return Err(Errno::ENOENT);
        }
        node_ref(dir);
        dir
    } else {
        let mut walk = Walk { ctx, link_depth: 0 };
        walk.namei(&path[..base_start], start, true)?
    };

    {
        let p = unsafe { &*parent };
        if !p.is_dir() {
            release_node(parent);
            return Err(Errno::ENOTDIR);
        }
        if !has_perm(ctx, parent, PERM_EXEC) {
            release_node(parent);
            return Err(Errno::EACCES);
        }
    }

    let _ = follow_mpoints;
    Ok(ParentDir {
        parent,
        base_start,
        base_len,
        trailing_slash,
    })
}

/// Look the final component up under an already-resolved parent. With
/// `follow_mpoints` unset the mount-point inode itself comes back (the
/// mount/umount paths need it).
pub fn lookup_last(
    ctx: &FsContext,
    pd: &ParentDir,
    path: &[u8],
    follow_mpoints: bool,
    follow_symlink: bool,
) -> KResult<*mut Node> {
    if pd.base_len == 0 {
        node_ref(pd.parent);
        return Ok(pd.parent);
    }
    let name = &path[pd.base_start..pd.base_start + pd.base_len];
    node_ref(pd.parent);
    let child = walk_one(ctx, pd.parent, name, follow_mpoints)?;
    if follow_symlink && unsafe { s_islnk((*child).mode) } {
        let mut walk = Walk { ctx, link_depth: 0 };
        return walk.follow_symlink(child, pd.parent);
    }
    Ok(child)
}

/// Release the reference a `ParentDir` holds.
pub fn put_parent_dir(pd: &ParentDir) {
    release_node(pd.parent);
}

/// Null start-directory sentinel for path calls.
pub fn no_start() -> *mut Node {
    ptr::null_mut()
}

/// Wake anything sleeping on a node (used by the unlink paths).
pub fn wake_node_waiters(node: *mut Node) {
    services::unblock_all(node as usize);
}
