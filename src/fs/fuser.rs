//! Adapter between the FUSE transport and the handler surface.
//!
//! Each kernel request is moved onto the runtime's blocking pool inside its
//! own tracing span; the session loop thread never performs host I/O. The
//! adapter owns all wire-type translation: `stat64` into transport
//! attributes, transport setattr fields into a [`SetattrRequest`], lock
//! types into flock operations, and the capability negotiation in `init`.
//!
//! One invariant matters here: the node id the core hands out must also be
//! planted in the attribute's `ino` field, because the transport derives the
//! kernel-visible node id from it on entry replies.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    consts, fuse_forget_one, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use tracing::{debug, debug_span, warn};

use super::passthrough::{DirEntryOut, Entry, MirrorFs, SetattrRequest, TimeSet, XattrReply};
use super::{NodeId, RequestContext};

fn to_system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nsecs as u64)
    }
}

fn kind_of(mode: u32) -> fuser::FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => fuser::FileType::Directory,
        libc::S_IFLNK => fuser::FileType::Symlink,
        libc::S_IFCHR => fuser::FileType::CharDevice,
        libc::S_IFBLK => fuser::FileType::BlockDevice,
        libc::S_IFIFO => fuser::FileType::NamedPipe,
        libc::S_IFSOCK => fuser::FileType::Socket,
        _ => fuser::FileType::RegularFile,
    }
}

fn dirent_kind(type_: u8) -> fuser::FileType {
    match type_ {
        libc::DT_DIR => fuser::FileType::Directory,
        libc::DT_LNK => fuser::FileType::Symlink,
        libc::DT_CHR => fuser::FileType::CharDevice,
        libc::DT_BLK => fuser::FileType::BlockDevice,
        libc::DT_FIFO => fuser::FileType::NamedPipe,
        libc::DT_SOCK => fuser::FileType::Socket,
        _ => fuser::FileType::RegularFile,
    }
}

/// Host attributes as the transport wants them, with the node id planted in
/// `ino`.
fn attr_of(ino: NodeId, st: &libc::stat64) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: to_system_time(st.st_atime, st.st_atime_nsec),
        mtime: to_system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: to_system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: kind_of(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

/// Minimal attributes for `.`/`..` in readdirplus: dirent inode number,
/// directory mode, nothing else. No lookup happens for these.
fn dot_attr(dirent_ino: u64) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: dirent_ino,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: fuser::FileType::Directory,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 0,
        flags: 0,
    }
}

fn open_flags(direct_io: bool, keep_cache: bool) -> u32 {
    let mut flags = 0;
    if direct_io {
        flags |= consts::FOPEN_DIRECT_IO;
    }
    if keep_cache {
        flags |= consts::FOPEN_KEEP_CACHE;
    }
    flags
}

fn time_set(t: TimeOrNow) -> TimeSet {
    match t {
        TimeOrNow::Now => TimeSet::Now,
        TimeOrNow::SpecificTime(at) => TimeSet::Stamp(at),
    }
}

fn ctx(req: &Request<'_>) -> RequestContext {
    RequestContext {
        uid: req.uid(),
        gid: req.gid(),
    }
}

/// Bridges [`MirrorFs`] onto the transport's session loop.
pub struct FuserAdapter {
    fs: Arc<MirrorFs>,
    runtime: tokio::runtime::Handle,
    ttl: Duration,
}

impl FuserAdapter {
    pub fn new(fs: Arc<MirrorFs>, runtime: tokio::runtime::Handle) -> Self {
        let ttl = fs.config().timeout;
        FuserAdapter { fs, runtime, ttl }
    }

    fn spawn(&self, span: tracing::Span, f: impl FnOnce(Arc<MirrorFs>) + Send + 'static) {
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn_blocking(move || span.in_scope(|| f(fs)));
    }

    fn reply_entry(ttl: Duration, entry: &Entry, reply: ReplyEntry) {
        reply.entry(&ttl, &attr_of(entry.ino, &entry.attr), 0);
    }
}

impl fuser::Filesystem for FuserAdapter {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        // Export support costs nothing; take it whenever the kernel offers.
        let _ = config.add_capabilities(consts::FUSE_EXPORT_SUPPORT);

        if self.fs.config().writeback {
            if config.add_capabilities(consts::FUSE_WRITEBACK_CACHE).is_ok() {
                debug!("activating writeback cache");
                self.fs.set_writeback(true);
            } else {
                warn!("writeback requested but not offered by the kernel");
            }
        }
        if self.fs.config().flock {
            if config.add_capabilities(consts::FUSE_FLOCK_LOCKS).is_ok() {
                debug!("activating flock locks");
            } else {
                warn!("flock requested but not offered by the kernel");
            }
        }
        if self.fs.config().readdirplus_enabled() {
            let _ = config
                .add_capabilities(consts::FUSE_DO_READDIRPLUS | consts::FUSE_READDIRPLUS_AUTO);
        } else {
            debug!("readdirplus disabled");
        }
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        let ttl = self.ttl;
        let span = debug_span!("lookup", parent, ?name);
        self.spawn(span, move |fs| match fs.lookup(parent, &name) {
            Ok(entry) => Self::reply_entry(ttl, &entry, reply),
            Err(e) => reply.error(e.into()),
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        let span = debug_span!("forget", ino, nlookup);
        self.spawn(span, move |fs| fs.forget(ino, nlookup));
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuse_forget_one]) {
        let forgets: Vec<(NodeId, u64)> = nodes.iter().map(|n| (n.nodeid, n.nlookup)).collect();
        let span = debug_span!("batch_forget", count = forgets.len());
        self.spawn(span, move |fs| fs.forget_multi(&forgets));
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let ttl = self.ttl;
        let span = debug_span!("getattr", ino);
        self.spawn(span, move |fs| match fs.getattr(ino) {
            Ok(st) => reply.attr(&ttl, &attr_of(ino, &st)),
            Err(e) => reply.error(e.into()),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let request = SetattrRequest {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_set),
            mtime: mtime.map(time_set),
        };
        let ttl = self.ttl;
        let span = debug_span!("setattr", ino, ?fh);
        self.spawn(span, move |fs| match fs.setattr(ino, request, fh) {
            Ok(st) => reply.attr(&ttl, &attr_of(ino, &st)),
            Err(e) => reply.error(e.into()),
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let span = debug_span!("readlink", ino);
        self.spawn(span, move |fs| match fs.readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.into()),
        });
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        let caller = ctx(req);
        let ttl = self.ttl;
        let span = debug_span!("mknod", parent, ?name, mode);
        self.spawn(span, move |fs| {
            match fs.mknod(&caller, parent, &name, mode, u64::from(rdev)) {
                Ok(entry) => Self::reply_entry(ttl, &entry, reply),
                Err(e) => reply.error(e.into()),
            }
        });
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        let caller = ctx(req);
        let ttl = self.ttl;
        let span = debug_span!("mkdir", parent, ?name, mode);
        self.spawn(span, move |fs| match fs.mkdir(&caller, parent, &name, mode) {
            Ok(entry) => Self::reply_entry(ttl, &entry, reply),
            Err(e) => reply.error(e.into()),
        });
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let name = link_name.to_owned();
        let target = target.as_os_str().to_owned();
        let caller = ctx(req);
        let ttl = self.ttl;
        let span = debug_span!("symlink", parent, ?name);
        self.spawn(span, move |fs| {
            match fs.symlink(&caller, parent, &name, &target) {
                Ok(entry) => Self::reply_entry(ttl, &entry, reply),
                Err(e) => reply.error(e.into()),
            }
        });
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let name = newname.to_owned();
        let ttl = self.ttl;
        let span = debug_span!("link", ino, newparent, ?name);
        self.spawn(span, move |fs| match fs.link(ino, newparent, &name) {
            Ok(entry) => Self::reply_entry(ttl, &entry, reply),
            Err(e) => reply.error(e.into()),
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        let span = debug_span!("unlink", parent, ?name);
        self.spawn(span, move |fs| match fs.unlink(parent, &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        let span = debug_span!("rmdir", parent, ?name);
        self.spawn(span, move |fs| match fs.rmdir(parent, &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_owned();
        let newname = newname.to_owned();
        let span = debug_span!("rename", parent, ?name, newparent, ?newname, flags);
        self.spawn(span, move |fs| {
            match fs.rename(parent, &name, newparent, &newname, flags) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.into()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let span = debug_span!("open", ino, flags);
        self.spawn(span, move |fs| match fs.open(ino, flags) {
            Ok(opened) => {
                reply.opened(opened.fh, open_flags(opened.direct_io, opened.keep_cache));
            }
            Err(e) => reply.error(e.into()),
        });
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_owned();
        let caller = ctx(req);
        let ttl = self.ttl;
        let span = debug_span!("create", parent, ?name, mode, flags);
        self.spawn(span, move |fs| {
            match fs.create(&caller, parent, &name, mode, flags) {
                Ok((entry, opened)) => reply.created(
                    &ttl,
                    &attr_of(entry.ino, &entry.attr),
                    0,
                    opened.fh,
                    open_flags(opened.direct_io, opened.keep_cache),
                ),
                Err(e) => reply.error(e.into()),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let span = debug_span!("read", ino, fh, offset, size);
        self.spawn(span, move |fs| match fs.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.into()),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        let span = debug_span!("write", ino, fh, offset, size = data.len());
        self.spawn(span, move |fs| match fs.write(ino, fh, offset, &data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.into()),
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let span = debug_span!("flush", ino, fh);
        self.spawn(span, move |fs| match fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let span = debug_span!("release", ino, fh);
        self.spawn(span, move |fs| match fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let span = debug_span!("fsync", ino, fh, datasync);
        self.spawn(span, move |fs| match fs.fsync(ino, Some(fh), datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let span = debug_span!("opendir", ino);
        self.spawn(span, move |fs| match fs.opendir(ino) {
            Ok(opened) => {
                reply.opened(opened.fh, open_flags(opened.direct_io, opened.keep_cache));
            }
            Err(e) => reply.error(e.into()),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let span = debug_span!("readdir", ino, fh, offset);
        self.spawn(span, move |fs| {
            let mut filler = |entry: DirEntryOut<'_>| {
                reply.add(
                    entry.ino,
                    entry.next_offset,
                    dirent_kind(entry.type_),
                    entry.name,
                )
            };
            match fs.readdir(ino, fh, offset, false, &mut filler) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.into()),
            }
        });
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let ttl = self.ttl;
        let span = debug_span!("readdirplus", ino, fh, offset);
        self.spawn(span, move |fs| {
            let mut filler = |entry: DirEntryOut<'_>| match entry.entry {
                Some(looked_up) => reply.add(
                    looked_up.ino,
                    entry.next_offset,
                    entry.name,
                    &ttl,
                    &attr_of(looked_up.ino, &looked_up.attr),
                    0,
                ),
                // `.` and `..` are never looked up; node id 0 tells the
                // kernel not to cache an entry for them.
                None => reply.add(
                    0,
                    entry.next_offset,
                    entry.name,
                    &Duration::ZERO,
                    &dot_attr(entry.ino),
                    0,
                ),
            };
            match fs.readdir(ino, fh, offset, true, &mut filler) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.into()),
            }
        });
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let span = debug_span!("releasedir", ino, fh);
        self.spawn(span, move |fs| match fs.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        });
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let span = debug_span!("fsyncdir", ino, fh, datasync);
        self.spawn(span, move |fs| match fs.fsyncdir(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let span = debug_span!("statfs", ino);
        self.spawn(span, move |fs| match fs.statfs(ino) {
            Ok(st) => reply.statfs(
                st.f_blocks,
                st.f_bfree,
                st.f_bavail,
                st.f_files,
                st.f_ffree,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(e) => reply.error(e.into()),
        });
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let span = debug_span!("fallocate", ino, fh, offset, length, mode);
        self.spawn(span, move |fs| {
            match fs.fallocate(ino, fh, mode, offset, length) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.into()),
            }
        });
    }

    /// Lock requests arrive through the transport's setlk surface; with
    /// flock negotiation active they describe whole-file locks, which map
    /// onto `flock(2)` on the open's descriptor.
    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        typ: i32,
        _pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let mut op = match typ {
            libc::F_RDLCK => libc::LOCK_SH,
            libc::F_WRLCK => libc::LOCK_EX,
            libc::F_UNLCK => libc::LOCK_UN,
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        if !sleep && op != libc::LOCK_UN {
            op |= libc::LOCK_NB;
        }
        let span = debug_span!("flock", ino, fh, op);
        self.spawn(span, move |fs| match fs.flock(fh, op) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        });
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = name.to_owned();
        let span = debug_span!("getxattr", ino, ?name, size);
        self.spawn(span, move |fs| match fs.getxattr(ino, &name, size) {
            Ok(XattrReply::Size(n)) => reply.size(n),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(e) => reply.error(e.into()),
        });
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let span = debug_span!("listxattr", ino, size);
        self.spawn(span, move |fs| match fs.listxattr(ino, size) {
            Ok(XattrReply::Size(n)) => reply.size(n),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(e) => reply.error(e.into()),
        });
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_owned();
        let value = value.to_vec();
        let span = debug_span!("setxattr", ino, ?name, size = value.len());
        self.spawn(span, move |fs| match fs.setxattr(ino, &name, &value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        });
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        let span = debug_span!("removexattr", ino, ?name);
        self.spawn(span, move |fs| match fs.removexattr(ino, &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
        reply: ReplyWrite,
    ) {
        let span = debug_span!("copy_file_range", ino_in, fh_in, ino_out, fh_out, len);
        self.spawn(span, move |fs| {
            match fs.copy_file_range(fh_in, offset_in, fh_out, offset_out, len as usize, flags) {
                Ok(copied) => reply.written(copied as u32),
                Err(e) => reply.error(e.into()),
            }
        });
    }
}
