//! Parent-directory recovery for syscalls that have no `O_PATH` variant.
//!
//! Setting times on a symlink or hard-linking one cannot be expressed
//! through an anchor descriptor alone; the caller needs a real
//! `(parent fd, leaf name)` pair to reissue the syscall with. This module
//! reconstructs that pair from the self-fd symlink of the inode's anchor and
//! verifies it still names the same host object, retrying a couple of times
//! if the source tree moved underneath us.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use tracing::warn;

use super::error::{FsError, OpResult};
use super::inode::{InodeData, InodeKey, InodeTable, NodeId, ROOT_ID};
use super::sys;

const RETRIES: u32 = 2;

/// A recovered parent and the leaf name under it.
///
/// The caller owns one reference on `id` and must release it with
/// `unref` once the reissued syscall is done.
#[derive(Debug)]
pub struct ParentAndName {
    pub id: NodeId,
    pub parent: Arc<InodeData>,
    pub name: CString,
}

/// Recover a `(parent, leaf)` pair that names `inode` with high probability.
///
/// Concurrent renames make this inherently racy: each attempt re-reads the
/// anchor's current path and re-verifies that the leaf still has the
/// inode's identity. After two failed retries the operation surfaces EIO;
/// a source tree in a permanent rename loop is not our problem to solve.
pub fn parent_and_name(table: &InodeTable, inode: &InodeData) -> OpResult<ParentAndName> {
    let mut retries = RETRIES;
    loop {
        let exhausted = retries == 0;

        let path = match sys::fd_path(inode.raw_fd()) {
            Ok(path) => path,
            Err(e) => {
                // readlink failure or overflow will not improve on retry.
                warn!("failed to read the anchor's path: {e}");
                return Err(FsError::PathResolution);
            }
        };

        let bytes = path.as_os_str().as_bytes();
        let Some(slash) = bytes.iter().rposition(|&b| b == b'/') else {
            warn!(path = %path.display(), "anchor path has no slash");
            return Err(FsError::PathResolution);
        };
        let leaf = &bytes[slash + 1..];

        let found = if slash == 0 {
            // The parent is the filesystem root, which can only be our own
            // root inode.
            table.ref_again(table.root());
            Some((ROOT_ID, Arc::clone(table.root())))
        } else {
            let parent_path = CString::new(&bytes[..slash])
                .map_err(|_| FsError::PathResolution)?;
            match sys::stat_at(libc::AT_FDCWD, &parent_path, 0) {
                Ok(st) => {
                    let key = InodeKey::of(&st);
                    if key == table.root().key() {
                        table.ref_again(table.root());
                        Some((ROOT_ID, Arc::clone(table.root())))
                    } else {
                        table.find(key)
                    }
                }
                Err(e) => {
                    if exhausted {
                        warn!("failed to stat the recovered parent: {e}");
                    }
                    None
                }
            }
        };

        let Some((id, parent)) = found else {
            if exhausted {
                warn!("recovered parent is not in the inode table");
                return Err(FsError::PathResolution);
            }
            retries -= 1;
            continue;
        };

        let name = CString::new(leaf).map_err(|_| FsError::PathResolution)?;
        match sys::stat_at(parent.raw_fd(), &name, libc::AT_SYMLINK_NOFOLLOW) {
            Ok(st) if InodeKey::of(&st) == inode.key() => {
                return Ok(ParentAndName { id, parent, name });
            }
            Ok(_) => {
                // The tree moved between readlink and the verify stat.
                if exhausted {
                    warn!("recovered leaf no longer matches the inode");
                }
            }
            Err(e) => {
                if exhausted {
                    warn!("failed to stat the recovered leaf: {e}");
                }
            }
        }

        release(table, id);
        if exhausted {
            return Err(FsError::PathResolution);
        }
        retries -= 1;
    }
}

/// Drop the reference `parent_and_name` granted.
///
/// Eviction cannot happen here: the parent was reachable moments ago with a
/// refcount of at least one, and this releases only the transient reference.
pub fn release(table: &InodeTable, id: NodeId) {
    let evicted = table.unref(id, 1);
    debug_assert!(evicted.is_none(), "transient reference evicted the parent");
}
