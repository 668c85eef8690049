//! The request-handler surface.
//!
//! [`MirrorFs`] owns the inode table, the open-handle tables and the optional
//! registry client, and implements one method per filesystem operation. The
//! transport adapter translates wire requests into these calls and replies
//! with their results; everything here speaks host types (`stat64`, raw
//! flags, errno-carrying errors) and knows nothing about wire framing.

use std::ffi::{CStr, OsStr};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::config::{CachePolicy, Config};
use super::cred;
use super::dax::{self, MappingBackend};
use super::dirstream::DirStream;
use super::error::{FsError, OpResult};
use super::inode::{InodeData, InodeKey, InodeTable, NodeId};
use super::registry::{Registration, RegistryClient};
use super::resolver;
use super::sys;
use super::RequestContext;

/// What a lookup (or create-type operation) tells the kernel about an inode.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub ino: NodeId,
    pub attr: libc::stat64,
    pub attr_timeout: Duration,
    pub entry_timeout: Duration,
    /// Version counter at lookup time; 0 when versioning is disabled.
    pub initial_version: i64,
    /// The inode's slot in the shared version table; 0 when disabled.
    pub version_offset: u64,
}

/// A freshly opened file or directory handle.
#[derive(Debug, Clone, Copy)]
pub struct OpenedFile {
    pub fh: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
}

/// A timestamp update: either "now" or an explicit stamp.
#[derive(Debug, Clone, Copy)]
pub enum TimeSet {
    Now,
    Stamp(SystemTime),
}

/// The subset of attributes a setattr wants changed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetattrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeSet>,
    pub mtime: Option<TimeSet>,
}

/// Reply to a getxattr/listxattr: the value, or just its size when the
/// client probed with a zero-length buffer.
#[derive(Debug)]
pub enum XattrReply {
    Size(u32),
    Data(Vec<u8>),
}

/// One directory entry offered to the reply buffer.
///
/// `entry` is populated for readdirplus entries that went through a full
/// lookup; dot entries and plain readdir carry only the dirent fields.
#[derive(Debug)]
pub struct DirEntryOut<'a> {
    pub name: &'a OsStr,
    /// Inode number straight from the host dirent.
    pub ino: u64,
    /// Host `DT_*` type byte.
    pub type_: u8,
    /// Continuation cookie for the entry after this one.
    pub next_offset: i64,
    pub entry: Option<Entry>,
}

/// Returns `true` when the entry did NOT fit; the callee must not commit it.
pub type DirFiller<'a> = dyn FnMut(DirEntryOut<'_>) -> bool + 'a;

fn ebadf() -> FsError {
    FsError::Os(io::Error::from_raw_os_error(libc::EBADF))
}

fn timespec_omit() -> libc::timespec {
    libc::timespec {
        tv_sec: 0,
        tv_nsec: libc::UTIME_OMIT,
    }
}

fn timespec_from(set: TimeSet) -> libc::timespec {
    match set {
        TimeSet::Now => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        TimeSet::Stamp(at) => match at.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(d.subsec_nanos()),
            },
            Err(before) => {
                let d = before.duration();
                let carry = i64::from(d.subsec_nanos() > 0);
                libc::timespec {
                    tv_sec: -(d.as_secs() as libc::time_t) - carry,
                    tv_nsec: if carry == 1 {
                        1_000_000_000 - libc::c_long::from(d.subsec_nanos())
                    } else {
                        0
                    },
                }
            }
        },
    }
}

/// The passthrough filesystem over one source root.
pub struct MirrorFs {
    cfg: Config,
    table: InodeTable,
    registry: Option<RegistryClient>,

    files: Mutex<FxHashMap<u64, Arc<File>>>,
    dirs: Mutex<FxHashMap<u64, Arc<Mutex<DirStream>>>>,
    next_handle: AtomicU64,

    /// True once the kernel accepted writeback caching during negotiation.
    writeback: AtomicBool,
    mapping: Option<Arc<dyn MappingBackend>>,
}

impl MirrorFs {
    /// Seed the root inode and, in shared mode, join the registry.
    ///
    /// An unreachable registry socket is tolerated (versioning disables
    /// itself); a connected registry whose version table cannot be mapped is
    /// an error, which the bootstrap treats as fatal.
    pub fn new(cfg: Config) -> io::Result<Self> {
        let source = sys::to_cstring(cfg.source.as_os_str())?;
        let st = sys::stat_at(libc::AT_FDCWD, &source, libc::AT_SYMLINK_NOFOLLOW)?;
        if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("source '{}' is not a directory", cfg.source.display()),
            ));
        }

        let registry = if cfg.shared {
            RegistryClient::connect(&cfg.registry_socket, &cfg.version_table)?
        } else {
            None
        };

        let fd = sys::open(&source, libc::O_PATH | libc::O_CLOEXEC)?;
        let root_st = sys::stat_fd(fd.as_raw_fd())?;
        let reg = registry
            .as_ref()
            .and_then(|r| r.get(InodeKey::of(&root_st)))
            .unwrap_or(Registration {
                offset: 0,
                refid: 0,
            });
        let root = Arc::new(InodeData::new_root(fd, &root_st, reg.offset, reg.refid));

        Ok(MirrorFs {
            cfg,
            table: InodeTable::new(root),
            registry,
            files: Mutex::new(FxHashMap::default()),
            dirs: Mutex::new(FxHashMap::default()),
            next_handle: AtomicU64::new(1),
            writeback: AtomicBool::new(false),
            mapping: None,
        })
    }

    pub fn set_mapping_backend(&mut self, backend: Arc<dyn MappingBackend>) {
        self.mapping = Some(backend);
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Called by the adapter once capability negotiation settles.
    pub fn set_writeback(&self, enabled: bool) {
        self.writeback.store(enabled, Ordering::Relaxed);
    }

    fn writeback_active(&self) -> bool {
        self.writeback.load(Ordering::Relaxed)
    }

    // -- inode plumbing ----------------------------------------------------

    fn inode(&self, ino: NodeId) -> OpResult<Arc<InodeData>> {
        self.table.get(ino).ok_or(FsError::StaleNodeId)
    }

    fn unref_inode(&self, ino: NodeId, n: u64) {
        if let Some(evicted) = self.table.unref(ino, n) {
            if let Some(registry) = &self.registry {
                registry.put(evicted.registry_refid());
            }
        }
    }

    fn register(&self, key: InodeKey) -> Registration {
        self.registry
            .as_ref()
            .and_then(|r| r.get(key))
            .unwrap_or(Registration {
                offset: 0,
                refid: 0,
            })
    }

    fn get_version(&self, inode: &InodeData) -> i64 {
        match (&self.registry, inode.version_offset()) {
            (Some(registry), offset) if offset != 0 => registry.table().read(offset),
            _ => 0,
        }
    }

    fn bump_version(&self, inode: &InodeData) {
        if let (Some(registry), offset @ 1..) = (&self.registry, inode.version_offset()) {
            registry.table().bump(offset);
        }
    }

    fn lookup_child(&self, dir: &InodeData, name: &CStr) -> Option<(NodeId, Arc<InodeData>)> {
        let st = sys::stat_at(dir.raw_fd(), name, libc::AT_SYMLINK_NOFOLLOW).ok()?;
        self.table.find(InodeKey::of(&st))
    }

    fn entry_for(&self, ino: NodeId, inode: &InodeData, attr: libc::stat64) -> Entry {
        Entry {
            ino,
            attr,
            attr_timeout: self.cfg.timeout,
            entry_timeout: self.cfg.timeout,
            initial_version: self.get_version(inode),
            version_offset: inode.version_offset(),
        }
    }

    fn do_lookup(&self, parent: NodeId, name: &OsStr) -> OpResult<Entry> {
        let dir = self.inode(parent)?;
        let name_c = sys::to_cstring(name)?;

        let fd = sys::openat(
            dir.raw_fd(),
            &name_c,
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )?;
        let st = sys::stat_fd(fd.as_raw_fd())?;
        let key = InodeKey::of(&st);

        let (ino, inode) = match self.table.find(key) {
            // Known inode: the freshly opened anchor drops here.
            Some(hit) => hit,
            None => {
                let reg = self.register(key);
                let interned = self
                    .table
                    .intern(InodeData::new(fd, &st, reg.offset, reg.refid));
                if let Some(loser) = interned.rejected {
                    // Another thread interned the same key first; hand the
                    // candidate's slot back and let its anchor close.
                    if let Some(registry) = &self.registry {
                        registry.put(loser.registry_refid());
                    }
                }
                (interned.id, interned.inode)
            }
        };

        let initial_version = self.get_version(&inode);
        let attr = match sys::stat_fd(inode.raw_fd()) {
            Ok(attr) => attr,
            Err(e) => {
                self.unref_inode(ino, 1);
                return Err(e.into());
            }
        };

        debug!(
            parent,
            ?name,
            ino,
            version_offset = inode.version_offset(),
            initial_version,
            "resolved entry"
        );
        Ok(Entry {
            ino,
            attr,
            attr_timeout: self.cfg.timeout,
            entry_timeout: self.cfg.timeout,
            initial_version,
            version_offset: inode.version_offset(),
        })
    }

    // -- open-handle plumbing ----------------------------------------------

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_file(&self, file: File) -> u64 {
        let fh = self.alloc_handle();
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fh, Arc::new(file));
        fh
    }

    fn file(&self, fh: u64) -> OpResult<Arc<File>> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&fh)
            .map(Arc::clone)
            .ok_or_else(ebadf)
    }

    fn dir(&self, fh: u64) -> OpResult<Arc<Mutex<DirStream>>> {
        self.dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&fh)
            .map(Arc::clone)
            .ok_or_else(ebadf)
    }

    // -- handlers ----------------------------------------------------------

    pub fn lookup(&self, parent: NodeId, name: &OsStr) -> OpResult<Entry> {
        self.do_lookup(parent, name)
    }

    pub fn forget(&self, ino: NodeId, nlookup: u64) {
        self.unref_inode(ino, nlookup);
    }

    pub fn forget_multi(&self, forgets: &[(NodeId, u64)]) {
        for &(ino, nlookup) in forgets {
            self.unref_inode(ino, nlookup);
        }
    }

    pub fn getattr(&self, ino: NodeId) -> OpResult<libc::stat64> {
        let inode = self.inode(ino)?;
        Ok(sys::stat_fd(inode.raw_fd())?)
    }

    pub fn setattr(
        &self,
        ino: NodeId,
        req: SetattrRequest,
        fh: Option<u64>,
    ) -> OpResult<libc::stat64> {
        let inode = self.inode(ino)?;
        let file = match fh {
            Some(fh) => Some(self.file(fh)?),
            None => None,
        };

        if let Some(mode) = req.mode {
            match &file {
                Some(f) => sys::fchmod(f.as_raw_fd(), mode)?,
                None => sys::chmod(&sys::proc_self_fd(inode.raw_fd()), mode)?,
            }
        }
        if req.uid.is_some() || req.gid.is_some() {
            sys::fchownat_empty(inode.raw_fd(), req.uid, req.gid)?;
        }
        if let Some(size) = req.size {
            match &file {
                Some(f) => sys::ftruncate(f.as_raw_fd(), size)?,
                None => sys::truncate(&sys::proc_self_fd(inode.raw_fd()), size)?,
            }
        }
        if req.atime.is_some() || req.mtime.is_some() {
            let times = [
                req.atime.map_or_else(timespec_omit, timespec_from),
                req.mtime.map_or_else(timespec_omit, timespec_from),
            ];
            match &file {
                Some(f) => sys::futimens(f.as_raw_fd(), &times)?,
                None => self.set_times_pathless(&inode, &times)?,
            }
        }

        self.bump_version(&inode);
        self.getattr(ino)
    }

    /// Update times on an inode that has no open handle.
    ///
    /// Symlinks are the hard case: utimensat refuses an empty path on them,
    /// so the only way is through a recovered parent, which is racy.
    fn set_times_pathless(
        &self,
        inode: &InodeData,
        times: &[libc::timespec; 2],
    ) -> OpResult<()> {
        if !inode.is_symlink() {
            return Ok(sys::utimensat(
                libc::AT_FDCWD,
                &sys::proc_self_fd(inode.raw_fd()),
                times,
                0,
            )?);
        }

        match sys::utimensat(inode.raw_fd(), c"", times, libc::AT_EMPTY_PATH) {
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                if self.cfg.norace {
                    return Err(FsError::SymlinkRace);
                }
                let recovered = resolver::parent_and_name(&self.table, inode)?;
                let res = sys::utimensat(
                    recovered.parent.raw_fd(),
                    &recovered.name,
                    times,
                    libc::AT_SYMLINK_NOFOLLOW,
                );
                resolver::release(&self.table, recovered.id);
                Ok(res?)
            }
            other => Ok(other?),
        }
    }

    pub fn readlink(&self, ino: NodeId) -> OpResult<Vec<u8>> {
        let inode = self.inode(ino)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize + 1];
        let n = sys::readlinkat_empty(inode.raw_fd(), &mut buf)?;
        if n == buf.len() {
            // The target filled the buffer exactly; it may be truncated.
            return Err(FsError::LinkTooLong);
        }
        buf.truncate(n);
        Ok(buf)
    }

    fn create_node(
        &self,
        ctx: &RequestContext,
        parent: NodeId,
        name: &OsStr,
        create: impl FnOnce(&InodeData, &CStr) -> io::Result<()>,
    ) -> OpResult<Entry> {
        let dir = self.inode(parent)?;
        let name_c = sys::to_cstring(name)?;

        let res = {
            let _creds = cred::become_caller(ctx)?;
            create(&dir, &name_c)
        };
        res?;

        self.bump_version(&dir);
        self.do_lookup(parent, name)
    }

    pub fn mknod(
        &self,
        ctx: &RequestContext,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        rdev: u64,
    ) -> OpResult<Entry> {
        self.create_node(ctx, parent, name, |dir, name| {
            sys::mknodat(dir.raw_fd(), name, mode, rdev)
        })
    }

    pub fn mkdir(
        &self,
        ctx: &RequestContext,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
    ) -> OpResult<Entry> {
        self.create_node(ctx, parent, name, |dir, name| {
            sys::mkdirat(dir.raw_fd(), name, mode)
        })
    }

    pub fn symlink(
        &self,
        ctx: &RequestContext,
        parent: NodeId,
        name: &OsStr,
        target: &OsStr,
    ) -> OpResult<Entry> {
        let target_c = sys::to_cstring(target)?;
        self.create_node(ctx, parent, name, |dir, name| {
            sys::symlinkat(&target_c, dir.raw_fd(), name)
        })
    }

    pub fn link(&self, ino: NodeId, newparent: NodeId, name: &OsStr) -> OpResult<Entry> {
        let inode = self.inode(ino)?;
        let newdir = self.inode(newparent)?;
        let name_c = sys::to_cstring(name)?;

        self.link_pathless(&inode, newdir.raw_fd(), &name_c)?;

        let attr = sys::stat_fd(inode.raw_fd())?;
        self.table.ref_again(&inode);
        self.bump_version(&inode);
        self.bump_version(&newdir);
        Ok(self.entry_for(ino, &inode, attr))
    }

    /// Hard-link an inode known only by its anchor.
    ///
    /// Regular objects go through the self-fd symlink with follow semantics.
    /// For symlinks the empty-path form needs a capability most servers do
    /// not have, so it falls back to a recovered parent unless `norace`
    /// forbids that.
    fn link_pathless(&self, inode: &InodeData, newdir_fd: i32, name: &CStr) -> OpResult<()> {
        if !inode.is_symlink() {
            return Ok(sys::linkat(
                libc::AT_FDCWD,
                &sys::proc_self_fd(inode.raw_fd()),
                newdir_fd,
                name,
                libc::AT_SYMLINK_FOLLOW,
            )?);
        }

        match sys::linkat(inode.raw_fd(), c"", newdir_fd, name, libc::AT_EMPTY_PATH) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT | libc::EINVAL)) => {
                if self.cfg.norace {
                    return Err(FsError::SymlinkRace);
                }
                let recovered = resolver::parent_and_name(&self.table, inode)?;
                let res = sys::linkat(
                    recovered.parent.raw_fd(),
                    &recovered.name,
                    newdir_fd,
                    name,
                    0,
                );
                resolver::release(&self.table, recovered.id);
                Ok(res?)
            }
            other => Ok(other?),
        }
    }

    pub fn unlink(&self, parent: NodeId, name: &OsStr) -> OpResult<()> {
        self.remove_entry(parent, name, 0)
    }

    pub fn rmdir(&self, parent: NodeId, name: &OsStr) -> OpResult<()> {
        self.remove_entry(parent, name, libc::AT_REMOVEDIR)
    }

    fn remove_entry(&self, parent: NodeId, name: &OsStr, flags: libc::c_int) -> OpResult<()> {
        let dir = self.inode(parent)?;
        let name_c = sys::to_cstring(name)?;

        // The child is looked up first so its version can be bumped; removal
        // of something the kernel never looked up is an internal
        // inconsistency.
        let Some((child_id, child)) = self.lookup_child(&dir, &name_c) else {
            return Err(FsError::UnknownChild);
        };

        let res = sys::unlinkat(dir.raw_fd(), &name_c, flags);
        if res.is_ok() {
            self.bump_version(&child);
            self.bump_version(&dir);
        }
        self.unref_inode(child_id, 1);
        Ok(res?)
    }

    pub fn rename(
        &self,
        parent: NodeId,
        name: &OsStr,
        newparent: NodeId,
        newname: &OsStr,
        flags: u32,
    ) -> OpResult<()> {
        let dir = self.inode(parent)?;
        let newdir = self.inode(newparent)?;
        let name_c = sys::to_cstring(name)?;
        let newname_c = sys::to_cstring(newname)?;

        let old = self.lookup_child(&dir, &name_c);
        let new = self.lookup_child(&newdir, &newname_c);

        let result = (|| {
            let Some((_, old_inode)) = &old else {
                return Err(FsError::UnknownChild);
            };

            if flags != 0 {
                return match sys::renameat2(
                    dir.raw_fd(),
                    &name_c,
                    newdir.raw_fd(),
                    &newname_c,
                    flags,
                ) {
                    Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => {
                        Err(FsError::RenameFlags)
                    }
                    other => Ok(other?),
                };
            }

            sys::renameat(dir.raw_fd(), &name_c, newdir.raw_fd(), &newname_c)?;
            self.bump_version(old_inode);
            if let Some((_, new_inode)) = &new {
                self.bump_version(new_inode);
            }
            self.bump_version(&dir);
            self.bump_version(&newdir);
            Ok(())
        })();

        if let Some((id, _)) = old {
            self.unref_inode(id, 1);
        }
        if let Some((id, _)) = new {
            self.unref_inode(id, 1);
        }
        result
    }

    /// Promote write-only opens to read-write (a later shared write mapping
    /// needs read access) and, under writeback, strip O_APPEND since the
    /// kernel emulates it.
    fn adjust_open_flags(&self, flags: i32) -> (i32, bool) {
        let mut adjusted = flags;
        let mut promoted = false;
        if adjusted & libc::O_ACCMODE == libc::O_WRONLY {
            adjusted = (adjusted & !libc::O_ACCMODE) | libc::O_RDWR;
            promoted = true;
        }
        if self.writeback_active() && adjusted & libc::O_APPEND != 0 {
            adjusted &= !libc::O_APPEND;
        }
        (adjusted, promoted)
    }

    pub fn open(&self, ino: NodeId, flags: i32) -> OpResult<OpenedFile> {
        let inode = self.inode(ino)?;
        let (adjusted, promoted) = self.adjust_open_flags(flags);

        let fd = match sys::reopen_fd(inode.raw_fd(), adjusted & !libc::O_NOFOLLOW) {
            Ok(fd) => fd,
            // A write-only file refuses the promoted read-write open. The
            // promotion only serves mmap, so fall back to what the client
            // actually asked for, unless writeback is on, where the kernel
            // genuinely needs the read side.
            Err(e)
                if promoted
                    && !self.writeback_active()
                    && e.raw_os_error() == Some(libc::EACCES) =>
            {
                sys::reopen_fd(inode.raw_fd(), flags & !libc::O_NOFOLLOW)?
            }
            Err(e) => return Err(e.into()),
        };

        let fh = self.insert_file(File::from(fd));
        debug!(ino, flags, fh, "opened file");
        Ok(OpenedFile {
            fh,
            direct_io: self.cfg.cache == CachePolicy::None,
            keep_cache: self.cfg.cache == CachePolicy::Always,
        })
    }

    pub fn create(
        &self,
        ctx: &RequestContext,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> OpResult<(Entry, OpenedFile)> {
        let dir = self.inode(parent)?;
        let name_c = sys::to_cstring(name)?;
        let (adjusted, promoted) = self.adjust_open_flags(flags);

        let opened = {
            let _creds = cred::become_caller(ctx)?;
            match sys::openat_create(
                dir.raw_fd(),
                &name_c,
                (adjusted | libc::O_CREAT) & !libc::O_NOFOLLOW,
                mode,
            ) {
                Err(e)
                    if promoted
                        && !self.writeback_active()
                        && e.raw_os_error() == Some(libc::EACCES) =>
                {
                    sys::openat_create(
                        dir.raw_fd(),
                        &name_c,
                        (flags | libc::O_CREAT) & !libc::O_NOFOLLOW,
                        mode,
                    )
                }
                other => other,
            }
        };
        let fd = opened?;

        self.bump_version(&dir);
        let entry = self.do_lookup(parent, name)?;
        let fh = self.insert_file(File::from(fd));
        debug!(parent, ?name, ino = entry.ino, fh, "created file");
        Ok((
            entry,
            OpenedFile {
                fh,
                direct_io: false,
                keep_cache: false,
            },
        ))
    }

    pub fn read(&self, fh: u64, offset: i64, size: u32) -> OpResult<Vec<u8>> {
        let file = self.file(fh)?;
        let mut buf = vec![0u8; size as usize];
        let n = sys::pread(file.as_raw_fd(), &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&self, ino: NodeId, fh: u64, offset: i64, data: &[u8]) -> OpResult<usize> {
        let inode = self.inode(ino)?;
        let file = self.file(fh)?;

        let mut written = 0;
        while written < data.len() {
            match sys::pwrite(file.as_raw_fd(), &data[written..], offset + written as i64) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if written == 0 => return Err(e.into()),
                Err(_) => break,
            }
        }

        self.bump_version(&inode);
        Ok(written)
    }

    pub fn flush(&self, fh: u64) -> OpResult<()> {
        let file = self.file(fh)?;
        Ok(sys::flush(file.as_raw_fd())?)
    }

    pub fn release(&self, fh: u64) -> OpResult<()> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&fh)
            .map(|_| ())
            .ok_or_else(ebadf)
    }

    pub fn fsync(&self, ino: NodeId, fh: Option<u64>, datasync: bool) -> OpResult<()> {
        match fh {
            Some(fh) => {
                let file = self.file(fh)?;
                Ok(sys::fsync(file.as_raw_fd(), datasync)?)
            }
            None => {
                let inode = self.inode(ino)?;
                let fd = sys::reopen_fd(inode.raw_fd(), libc::O_RDWR)?;
                Ok(sys::fsync(fd.as_raw_fd(), datasync)?)
            }
        }
    }

    pub fn opendir(&self, ino: NodeId) -> OpResult<OpenedFile> {
        let inode = self.inode(ino)?;
        let stream = DirStream::open(inode.raw_fd())?;
        let fh = self.alloc_handle();
        self.dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fh, Arc::new(Mutex::new(stream)));
        Ok(OpenedFile {
            fh,
            direct_io: false,
            keep_cache: self.cfg.cache == CachePolicy::Always,
        })
    }

    /// Drive one readdir/readdirplus reply.
    ///
    /// Entries are offered to `filler` one at a time and only committed to
    /// the stream cursor when they fit. A plus-entry that overflows the
    /// buffer has taken a lookup reference which is released here, so its
    /// net refcount change is zero. Once anything was committed, errors are
    /// swallowed and the collected prefix is returned, since rolling entries back
    /// would desynchronize the kernel's lookup counts.
    pub fn readdir(
        &self,
        parent: NodeId,
        fh: u64,
        offset: i64,
        plus: bool,
        filler: &mut DirFiller<'_>,
    ) -> OpResult<()> {
        let stream = self.dir(fh)?;
        let mut stream = stream.lock().unwrap_or_else(|e| e.into_inner());
        stream.seek(offset);

        let mut committed = false;
        let result: OpResult<()> = loop {
            let entry = match stream.next() {
                Ok(Some(entry)) => entry,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            };
            let name = OsStr::from_bytes(entry.name.to_bytes());

            let full = if plus && !entry.is_dot_or_dotdot() {
                let child = match self.do_lookup(parent, name) {
                    Ok(child) => child,
                    Err(e) => break Err(e),
                };
                let full = filler(DirEntryOut {
                    name,
                    ino: entry.ino,
                    type_: entry.type_,
                    next_offset: entry.next_offset,
                    entry: Some(child),
                });
                if full {
                    // Undo the reference the uncommitted lookup took.
                    self.unref_inode(child.ino, 1);
                }
                full
            } else {
                filler(DirEntryOut {
                    name,
                    ino: entry.ino,
                    type_: entry.type_,
                    next_offset: entry.next_offset,
                    entry: None,
                })
            };

            if full {
                break Ok(());
            }
            stream.consume();
            committed = true;
        };

        match result {
            Err(e) if committed => {
                debug!("suppressing readdir error after a partial reply: {e}");
                Ok(())
            }
            other => other,
        }
    }

    pub fn releasedir(&self, fh: u64) -> OpResult<()> {
        self.dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&fh)
            .map(|_| ())
            .ok_or_else(ebadf)
    }

    pub fn fsyncdir(&self, fh: u64, datasync: bool) -> OpResult<()> {
        let stream = self.dir(fh)?;
        let fd = stream.lock().unwrap_or_else(|e| e.into_inner()).raw_fd();
        Ok(sys::fsync(fd, datasync)?)
    }

    pub fn statfs(&self, ino: NodeId) -> OpResult<libc::statvfs64> {
        let inode = self.inode(ino)?;
        Ok(sys::fstatvfs(inode.raw_fd())?)
    }

    pub fn fallocate(
        &self,
        ino: NodeId,
        fh: u64,
        mode: i32,
        offset: i64,
        length: i64,
    ) -> OpResult<()> {
        if mode != 0 {
            return Err(FsError::FallocateMode);
        }
        let inode = self.inode(ino)?;
        let file = self.file(fh)?;
        sys::posix_fallocate(file.as_raw_fd(), offset, length)?;
        self.bump_version(&inode);
        Ok(())
    }

    pub fn flock(&self, fh: u64, op: i32) -> OpResult<()> {
        let file = self.file(fh)?;
        Ok(sys::flock(file.as_raw_fd(), op)?)
    }

    // -- extended attributes -----------------------------------------------

    /// Xattrs are gated twice: the mount must have them enabled, and the
    /// inode must not be a symlink (the self-fd path form would follow it).
    fn xattr_inode(&self, ino: NodeId) -> OpResult<Arc<InodeData>> {
        if !self.cfg.xattr {
            return Err(FsError::XattrDisabled);
        }
        let inode = self.inode(ino)?;
        if inode.is_symlink() {
            return Err(FsError::SymlinkRace);
        }
        Ok(inode)
    }

    pub fn getxattr(&self, ino: NodeId, name: &OsStr, size: u32) -> OpResult<XattrReply> {
        let inode = self.xattr_inode(ino)?;
        let path = sys::proc_self_fd(inode.raw_fd());
        let name_c = sys::to_cstring(name)?;

        if size == 0 {
            let n = sys::getxattr(&path, &name_c, &mut [])?;
            Ok(XattrReply::Size(n as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            let n = sys::getxattr(&path, &name_c, &mut buf)?;
            buf.truncate(n);
            Ok(XattrReply::Data(buf))
        }
    }

    pub fn listxattr(&self, ino: NodeId, size: u32) -> OpResult<XattrReply> {
        let inode = self.xattr_inode(ino)?;
        let path = sys::proc_self_fd(inode.raw_fd());

        if size == 0 {
            let n = sys::listxattr(&path, &mut [])?;
            Ok(XattrReply::Size(n as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            let n = sys::listxattr(&path, &mut buf)?;
            buf.truncate(n);
            Ok(XattrReply::Data(buf))
        }
    }

    pub fn setxattr(&self, ino: NodeId, name: &OsStr, value: &[u8], flags: i32) -> OpResult<()> {
        let inode = self.xattr_inode(ino)?;
        let path = sys::proc_self_fd(inode.raw_fd());
        let name_c = sys::to_cstring(name)?;
        sys::setxattr(&path, &name_c, value, flags)?;
        self.bump_version(&inode);
        Ok(())
    }

    pub fn removexattr(&self, ino: NodeId, name: &OsStr) -> OpResult<()> {
        let inode = self.xattr_inode(ino)?;
        let path = sys::proc_self_fd(inode.raw_fd());
        let name_c = sys::to_cstring(name)?;
        sys::removexattr(&path, &name_c)?;
        self.bump_version(&inode);
        Ok(())
    }

    pub fn copy_file_range(
        &self,
        fh_in: u64,
        offset_in: i64,
        fh_out: u64,
        offset_out: i64,
        len: usize,
        flags: u32,
    ) -> OpResult<usize> {
        let file_in = self.file(fh_in)?;
        let file_out = self.file(fh_out)?;
        Ok(sys::copy_file_range(
            file_in.as_raw_fd(),
            offset_in,
            file_out.as_raw_fd(),
            offset_out,
            len,
            flags,
        )?)
    }

    // -- DAX mappings ------------------------------------------------------

    pub fn setupmapping(
        &self,
        ino: NodeId,
        fh: Option<u64>,
        file_offset: u64,
        len: u64,
        mem_offset: u64,
        flags: u64,
    ) -> OpResult<()> {
        let Some(backend) = &self.mapping else {
            return Err(FsError::MappingUnavailable);
        };
        let map_flags = dax::flags_for_open(flags);

        let res = match fh {
            Some(fh) => {
                let file = self.file(fh)?;
                backend.map(file.as_fd(), file_offset, len, mem_offset, map_flags)
            }
            None => {
                let inode = self.inode(ino)?;
                let fd = sys::reopen_fd(inode.raw_fd(), libc::O_RDWR)?;
                backend.map(fd.as_fd(), file_offset, len, mem_offset, map_flags)
            }
        };
        res.map_err(|e| {
            warn!(ino, mem_offset, "mapping request failed: {e}");
            FsError::MappingFailed
        })
    }

    pub fn removemapping(&self, mem_offset: u64, len: u64) -> OpResult<()> {
        let Some(backend) = &self.mapping else {
            return Err(FsError::MappingUnavailable);
        };
        backend.unmap(mem_offset, len).map_err(|e| {
            warn!(mem_offset, len, "unmapping request failed: {e}");
            FsError::MappingFailed
        })
    }

    // -- diagnostics -------------------------------------------------------

    /// Current version counter of an inode (0 when versioning is disabled).
    pub fn version_of(&self, ino: NodeId) -> OpResult<i64> {
        let inode = self.inode(ino)?;
        Ok(self.get_version(&inode))
    }

    /// Number of non-root inodes currently tracked.
    pub fn inode_count(&self) -> usize {
        self.table.len()
    }

    /// Reference count of an inode, if it is still tracked.
    pub fn refcount_of(&self, ino: NodeId) -> Option<u64> {
        self.table.get(ino).map(|inode| inode.refcount())
    }
}
