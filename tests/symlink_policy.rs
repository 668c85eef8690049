//! Symlink handling: readlink, the racy-path fallback, the `norace` policy,
//! and the xattr gates.

mod common;

use mirrorfs::fs::passthrough::{SetattrRequest, TimeSet, XattrReply};
use mirrorfs::fs::ROOT_ID;

#[test]
fn symlink_and_readlink_round_trip() {
    let src = tempfile::tempdir().unwrap();
    let fs = common::mirror(src.path());

    let entry = fs
        .symlink(&common::caller(), ROOT_ID, "s".as_ref(), "target".as_ref())
        .unwrap();
    assert_eq!(common::mode_of(&entry), libc::S_IFLNK);

    let target = fs.readlink(entry.ino).unwrap();
    assert_eq!(target, b"target");

    let host = std::fs::read_link(src.path().join("s")).unwrap();
    assert_eq!(host.as_os_str(), "target");
}

#[test]
fn norace_refuses_symlink_time_updates() {
    let src = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink("target", src.path().join("s")).unwrap();
    let fs = common::mirror_with(src.path(), |cfg| cfg.norace = true);

    let entry = common::lookup_root(&fs, "s");
    let err = fs
        .setattr(
            entry.ino,
            SetattrRequest {
                atime: Some(TimeSet::Now),
                ..SetattrRequest::default()
            },
            None,
        )
        .unwrap_err();
    assert_eq!(i32::from(err), libc::EPERM);
}

#[test]
fn symlink_time_updates_fall_back_through_the_parent() {
    let src = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink("target", src.path().join("s")).unwrap();
    let fs = common::mirror(src.path());

    let entry = common::lookup_root(&fs, "s");
    // The parent here is the root inode, which the resolver recognizes by
    // its host identity. Outcome depends on the host kernel; it must not
    // wedge or panic.
    let res = fs.setattr(
        entry.ino,
        SetattrRequest {
            atime: Some(TimeSet::Now),
            mtime: Some(TimeSet::Now),
            ..SetattrRequest::default()
        },
        None,
    );
    match res {
        Ok(_) => {}
        Err(e) => assert_eq!(i32::from(e), libc::EPERM),
    }
    assert_eq!(fs.refcount_of(entry.ino), Some(1), "no reference leaked");
}

#[test]
fn symlink_time_fallback_under_a_looked_up_directory() {
    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir(src.path().join("d")).unwrap();
    std::os::unix::fs::symlink("target", src.path().join("d/s")).unwrap();
    let fs = common::mirror(src.path());

    let dir = common::lookup_root(&fs, "d");
    let entry = fs.lookup(dir.ino, "s".as_ref()).unwrap();

    fs.setattr(
        entry.ino,
        SetattrRequest {
            atime: Some(TimeSet::Now),
            mtime: Some(TimeSet::Now),
            ..SetattrRequest::default()
        },
        None,
    )
    .expect("fallback resolves through the interned parent");

    assert_eq!(
        fs.refcount_of(dir.ino),
        Some(1),
        "the resolver's transient parent reference was released"
    );
}

#[test]
fn hardlinking_a_symlink_honors_norace() {
    let src = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink("target", src.path().join("s")).unwrap();

    // Without norace the fallback path succeeds.
    let fs = common::mirror(src.path());
    let entry = common::lookup_root(&fs, "s");
    let linked = fs.link(entry.ino, ROOT_ID, "s2".as_ref()).unwrap();
    assert_eq!(linked.attr.st_nlink, 2);

    // With norace the racy fallback is forbidden. A privileged server can
    // still take the race-free empty-path link, so only unprivileged runs
    // must see EPERM.
    std::os::unix::fs::symlink("target", src.path().join("t")).unwrap();
    let strict = common::mirror_with(src.path(), |cfg| cfg.norace = true);
    let t = common::lookup_root(&strict, "t");
    match strict.link(t.ino, ROOT_ID, "t2".as_ref()) {
        Ok(_) => {
            // SAFETY: geteuid cannot fail.
            assert_eq!(unsafe { libc::geteuid() }, 0);
        }
        Err(e) => assert_eq!(i32::from(e), libc::EPERM),
    }
}

#[test]
fn xattrs_are_enosys_when_disabled() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a"), b"x").unwrap();
    let fs = common::mirror(src.path());

    let entry = common::lookup_root(&fs, "a");
    let err = fs.getxattr(entry.ino, "user.k".as_ref(), 0).unwrap_err();
    assert_eq!(i32::from(err), libc::ENOSYS);
    let err = fs
        .setxattr(entry.ino, "user.k".as_ref(), b"v", 0)
        .unwrap_err();
    assert_eq!(i32::from(err), libc::ENOSYS);
}

#[test]
fn xattrs_on_symlinks_are_eperm() {
    let src = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink("target", src.path().join("s")).unwrap();
    let fs = common::mirror_with(src.path(), |cfg| cfg.xattr = true);

    let entry = common::lookup_root(&fs, "s");
    let err = fs.listxattr(entry.ino, 0).unwrap_err();
    assert_eq!(i32::from(err), libc::EPERM);
    let err = fs.removexattr(entry.ino, "user.k".as_ref()).unwrap_err();
    assert_eq!(i32::from(err), libc::EPERM);
}

#[test]
fn xattr_round_trip_where_the_host_supports_it() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a"), b"x").unwrap();
    let fs = common::mirror_with(src.path(), |cfg| cfg.xattr = true);

    let entry = common::lookup_root(&fs, "a");
    if let Err(e) = fs.setxattr(entry.ino, "user.k".as_ref(), b"v", 0) {
        // The scratch tree may live on a filesystem without user xattrs.
        assert_eq!(i32::from(e), libc::EOPNOTSUPP);
        return;
    }

    match fs.getxattr(entry.ino, "user.k".as_ref(), 0).unwrap() {
        XattrReply::Size(n) => assert_eq!(n, 1),
        XattrReply::Data(_) => panic!("a zero-size probe replies with the size"),
    }
    match fs.getxattr(entry.ino, "user.k".as_ref(), 16).unwrap() {
        XattrReply::Data(v) => assert_eq!(v, b"v"),
        XattrReply::Size(_) => panic!("a sized read replies with the value"),
    }

    match fs.listxattr(entry.ino, 64).unwrap() {
        XattrReply::Data(list) => {
            assert!(list.split(|&b| b == 0).any(|n| n == b"user.k"));
        }
        XattrReply::Size(_) => panic!("a sized list replies with the names"),
    }

    fs.removexattr(entry.ino, "user.k".as_ref()).unwrap();
    let err = fs.getxattr(entry.ino, "user.k".as_ref(), 16).unwrap_err();
    assert_eq!(i32::from(err), libc::ENODATA);
}
