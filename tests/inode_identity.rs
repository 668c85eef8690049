//! Canonicality and refcount discipline of the inode table, driven through
//! the lookup/forget surface.

mod common;

use std::sync::Arc;

use mirrorfs::fs::ROOT_ID;

#[test]
fn repeated_lookups_return_one_canonical_inode() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a"), b"hello").unwrap();
    let fs = common::mirror(src.path());

    let first = common::lookup_root(&fs, "a");
    let second = common::lookup_root(&fs, "a");
    let third = common::lookup_root(&fs, "a");

    assert_eq!(first.ino, second.ino);
    assert_eq!(second.ino, third.ino);
    assert_eq!(fs.inode_count(), 1);
    assert_eq!(fs.refcount_of(first.ino), Some(3));
}

#[test]
fn hard_links_share_an_identity() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a"), b"x").unwrap();
    std::fs::hard_link(src.path().join("a"), src.path().join("b")).unwrap();
    let fs = common::mirror(src.path());

    let a = common::lookup_root(&fs, "a");
    let b = common::lookup_root(&fs, "b");

    assert_eq!(a.ino, b.ino, "same (dev,ino) must map to one inode");
    assert_eq!(fs.inode_count(), 1);
}

#[test]
fn balanced_forgets_evict_and_invalidate() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a"), b"x").unwrap();
    let fs = common::mirror(src.path());

    let entry = common::lookup_root(&fs, "a");
    common::lookup_root(&fs, "a");
    assert_eq!(fs.refcount_of(entry.ino), Some(2));

    fs.forget(entry.ino, 1);
    assert_eq!(fs.refcount_of(entry.ino), Some(1));

    fs.forget(entry.ino, 1);
    assert_eq!(fs.inode_count(), 0, "table holds only the root");
    assert!(fs.refcount_of(entry.ino).is_none(), "id went stale");

    // A stale id is rejected, not resurrected.
    let err = fs.getattr(entry.ino).unwrap_err();
    assert_eq!(i32::from(err), libc::EBADF);
}

#[test]
fn forget_multi_drops_the_supplied_amounts() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a"), b"x").unwrap();
    std::fs::write(src.path().join("b"), b"y").unwrap();
    let fs = common::mirror(src.path());

    let a = common::lookup_root(&fs, "a");
    common::lookup_root(&fs, "a");
    common::lookup_root(&fs, "a");
    let b = common::lookup_root(&fs, "b");

    fs.forget_multi(&[(a.ino, 3), (b.ino, 1)]);
    assert_eq!(fs.inode_count(), 0);
}

#[test]
fn concurrent_lookups_agree_on_identity_and_count() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 125;

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a"), b"x").unwrap();
    let fs = Arc::new(common::mirror(src.path()));

    let mut workers = Vec::new();
    for _ in 0..THREADS {
        let fs = Arc::clone(&fs);
        workers.push(std::thread::spawn(move || {
            let mut inos = Vec::with_capacity(PER_THREAD);
            for _ in 0..PER_THREAD {
                inos.push(common::lookup_root(&fs, "a").ino);
            }
            inos
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.join().unwrap());
    }

    let ino = all[0];
    assert!(all.iter().all(|&i| i == ino), "every handle decodes alike");
    assert_eq!(fs.inode_count(), 1);
    assert_eq!(fs.refcount_of(ino), Some((THREADS * PER_THREAD) as u64));

    fs.forget(ino, (THREADS * PER_THREAD) as u64);
    assert_eq!(fs.inode_count(), 0);
}

#[test]
fn the_root_survives_everything() {
    let src = tempfile::tempdir().unwrap();
    let fs = common::mirror(src.path());

    assert!(fs.getattr(ROOT_ID).is_ok());
    // The protocol forbids forgetting the root, but even a stray forget must
    // not unseat it.
    fs.forget(ROOT_ID, 1);
    assert!(fs.getattr(ROOT_ID).is_ok());
    assert_eq!(fs.inode_count(), 0);
}

#[test]
fn lookup_of_missing_names_is_enoent() {
    let src = tempfile::tempdir().unwrap();
    let fs = common::mirror(src.path());

    let err = fs.lookup(ROOT_ID, "ghost".as_ref()).unwrap_err();
    assert_eq!(i32::from(err), libc::ENOENT);
    assert_eq!(fs.inode_count(), 0);
}
