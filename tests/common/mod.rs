//! Shared fixtures: a [`MirrorFs`] over a scratch source tree, driven through
//! the handler surface directly; no kernel mount is involved.
#![allow(dead_code)]

use std::path::Path;

use mirrorfs::fs::passthrough::Entry;
use mirrorfs::fs::{Config, MirrorFs, RequestContext, ROOT_ID};

/// A filesystem over `source` with registry participation disabled.
pub fn mirror(source: &Path) -> MirrorFs {
    let cfg = Config {
        source: source.to_path_buf(),
        ..Config::default()
    };
    MirrorFs::new(cfg).expect("filesystem over a scratch tree")
}

pub fn mirror_with(source: &Path, mutate: impl FnOnce(&mut Config)) -> MirrorFs {
    let mut cfg = Config {
        source: source.to_path_buf(),
        ..Config::default()
    };
    mutate(&mut cfg);
    MirrorFs::new(cfg).expect("filesystem over a scratch tree")
}

/// The current process's identity; create-type operations under it make the
/// credential switch a no-op.
pub fn caller() -> RequestContext {
    // SAFETY: geteuid/getegid cannot fail and modify no memory.
    unsafe {
        RequestContext {
            uid: libc::geteuid(),
            gid: libc::getegid(),
        }
    }
}

/// Look up `name` directly under the root.
pub fn lookup_root(fs: &MirrorFs, name: &str) -> Entry {
    fs.lookup(ROOT_ID, name.as_ref()).expect("lookup under root")
}

pub fn mode_of(entry: &Entry) -> u32 {
    entry.attr.st_mode & libc::S_IFMT
}
