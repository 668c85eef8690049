//! Thin wrappers over the host syscall surface.
//!
//! Everything here is a direct translation of one syscall into a safe
//! signature: raw descriptors in, `io::Result` out, errno preserved. The
//! handlers above never touch `libc` directly.

use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Converts a directory-entry name into the NUL-terminated form the host
/// expects. Interior NUL bytes cannot name anything on the host.
pub fn to_cstring(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// The `/proc/self/fd/N` form of a descriptor, used wherever a syscall has no
/// `*at` variant that accepts an empty path.
pub fn proc_self_fd(fd: RawFd) -> CString {
    CString::new(format!("/proc/self/fd/{fd}"))
        .unwrap_or_else(|_| unreachable!("proc path never contains a NUL byte"))
}

fn check_ret(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn check_len(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// `fstatat(fd, "", AT_EMPTY_PATH | AT_SYMLINK_NOFOLLOW)`: stat the object a
/// descriptor pins, without touching any path.
pub fn stat_fd(fd: RawFd) -> io::Result<libc::stat64> {
    stat_at(fd, c"", libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW)
}

pub fn stat_at(dirfd: RawFd, name: &CStr, flags: libc::c_int) -> io::Result<libc::stat64> {
    let mut st = MaybeUninit::<libc::stat64>::zeroed();

    // SAFETY: the kernel only writes into `st` and we check the return value.
    let res = unsafe { libc::fstatat64(dirfd, name.as_ptr(), st.as_mut_ptr(), flags) };
    check_ret(res)?;

    // SAFETY: a successful fstatat64 fully initializes the struct.
    Ok(unsafe { st.assume_init() })
}

pub fn openat(dirfd: RawFd, name: &CStr, flags: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: no memory is modified; the return value is checked before the
    // descriptor is adopted.
    let fd = unsafe { libc::openat(dirfd, name.as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by openat and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn openat_create(
    dirfd: RawFd,
    name: &CStr,
    flags: libc::c_int,
    mode: u32,
) -> io::Result<OwnedFd> {
    // SAFETY: as in `openat`; the mode argument is only read.
    let fd = unsafe { libc::openat(dirfd, name.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by openat and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn open(path: &CStr, flags: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: as in `openat`.
    let fd = unsafe { libc::open(path.as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by open and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Reopen the object behind an `O_PATH` anchor with real access modes, by
/// going through the self-fd symlink directory.
pub fn reopen_fd(fd: RawFd, flags: libc::c_int) -> io::Result<OwnedFd> {
    open(&proc_self_fd(fd), flags)
}

pub fn readlink(path: &CStr, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: the kernel writes at most `buf.len()` bytes into `buf`.
    let res = unsafe {
        libc::readlink(
            path.as_ptr(),
            buf.as_mut_ptr().cast::<libc::c_char>(),
            buf.len(),
        )
    };
    check_len(res)
}

/// `readlinkat(fd, "", ...)` for a symlink pinned by its own descriptor.
pub fn readlinkat_empty(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: the kernel writes at most `buf.len()` bytes into `buf`.
    let res = unsafe {
        libc::readlinkat(
            fd,
            c"".as_ptr(),
            buf.as_mut_ptr().cast::<libc::c_char>(),
            buf.len(),
        )
    };
    check_len(res)
}

/// Resolve a descriptor to the absolute host path it currently names.
pub fn fd_path(fd: RawFd) -> io::Result<PathBuf> {
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let n = readlink(&proc_self_fd(fd), &mut buf)?;
    if n >= buf.len() {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }
    buf.truncate(n);
    Ok(PathBuf::from(OsStr::from_bytes(&buf).to_owned()))
}

pub fn fchmod(fd: RawFd, mode: u32) -> io::Result<()> {
    // SAFETY: no memory is involved; the return value is checked.
    check_ret(unsafe { libc::fchmod(fd, mode as libc::mode_t) })
}

pub fn chmod(path: &CStr, mode: u32) -> io::Result<()> {
    // SAFETY: the path is a valid NUL-terminated string.
    check_ret(unsafe { libc::chmod(path.as_ptr(), mode as libc::mode_t) })
}

/// `fchownat(fd, "", uid, gid, AT_EMPTY_PATH | AT_SYMLINK_NOFOLLOW)`.
/// `None` leaves the corresponding id unchanged.
pub fn fchownat_empty(fd: RawFd, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    let uid = uid.map_or(libc::uid_t::MAX, |u| u as libc::uid_t);
    let gid = gid.map_or(libc::gid_t::MAX, |g| g as libc::gid_t);
    // SAFETY: the path is a valid NUL-terminated string.
    check_ret(unsafe {
        libc::fchownat(
            fd,
            c"".as_ptr(),
            uid,
            gid,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

pub fn ftruncate(fd: RawFd, size: u64) -> io::Result<()> {
    // SAFETY: no memory is involved; the return value is checked.
    check_ret(unsafe { libc::ftruncate64(fd, size as libc::off64_t) })
}

pub fn truncate(path: &CStr, size: u64) -> io::Result<()> {
    // SAFETY: the path is a valid NUL-terminated string.
    check_ret(unsafe { libc::truncate64(path.as_ptr(), size as libc::off64_t) })
}

pub fn futimens(fd: RawFd, times: &[libc::timespec; 2]) -> io::Result<()> {
    // SAFETY: `times` points at two valid timespec values for the whole call.
    check_ret(unsafe { libc::futimens(fd, times.as_ptr()) })
}

pub fn utimensat(
    dirfd: RawFd,
    path: &CStr,
    times: &[libc::timespec; 2],
    flags: libc::c_int,
) -> io::Result<()> {
    // SAFETY: the path and the timespec array are valid for the whole call.
    check_ret(unsafe { libc::utimensat(dirfd, path.as_ptr(), times.as_ptr(), flags) })
}

pub fn mkdirat(dirfd: RawFd, name: &CStr, mode: u32) -> io::Result<()> {
    // SAFETY: the path is a valid NUL-terminated string.
    check_ret(unsafe { libc::mkdirat(dirfd, name.as_ptr(), mode as libc::mode_t) })
}

pub fn symlinkat(target: &CStr, dirfd: RawFd, name: &CStr) -> io::Result<()> {
    // SAFETY: both paths are valid NUL-terminated strings.
    check_ret(unsafe { libc::symlinkat(target.as_ptr(), dirfd, name.as_ptr()) })
}

pub fn mknodat(dirfd: RawFd, name: &CStr, mode: u32, rdev: u64) -> io::Result<()> {
    // SAFETY: the path is a valid NUL-terminated string.
    check_ret(unsafe {
        libc::mknodat(
            dirfd,
            name.as_ptr(),
            mode as libc::mode_t,
            rdev as libc::dev_t,
        )
    })
}

pub fn linkat(
    olddirfd: RawFd,
    oldpath: &CStr,
    newdirfd: RawFd,
    newpath: &CStr,
    flags: libc::c_int,
) -> io::Result<()> {
    // SAFETY: both paths are valid NUL-terminated strings.
    check_ret(unsafe {
        libc::linkat(olddirfd, oldpath.as_ptr(), newdirfd, newpath.as_ptr(), flags)
    })
}

pub fn unlinkat(dirfd: RawFd, name: &CStr, flags: libc::c_int) -> io::Result<()> {
    // SAFETY: the path is a valid NUL-terminated string.
    check_ret(unsafe { libc::unlinkat(dirfd, name.as_ptr(), flags) })
}

pub fn renameat(
    olddirfd: RawFd,
    oldpath: &CStr,
    newdirfd: RawFd,
    newpath: &CStr,
) -> io::Result<()> {
    // SAFETY: both paths are valid NUL-terminated strings.
    check_ret(unsafe {
        libc::renameat(olddirfd, oldpath.as_ptr(), newdirfd, newpath.as_ptr())
    })
}

/// `renameat2` via the raw syscall so that running on a kernel without it
/// reports ENOSYS instead of failing at link time.
pub fn renameat2(
    olddirfd: RawFd,
    oldpath: &CStr,
    newdirfd: RawFd,
    newpath: &CStr,
    flags: u32,
) -> io::Result<()> {
    // SAFETY: both paths are valid NUL-terminated strings; the syscall does
    // not write to our memory.
    let res = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            olddirfd,
            oldpath.as_ptr(),
            newdirfd,
            newpath.as_ptr(),
            flags,
        )
    };
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> io::Result<usize> {
    // SAFETY: the kernel writes at most `buf.len()` bytes into `buf`.
    let res = unsafe {
        libc::pread64(
            fd,
            buf.as_mut_ptr().cast::<libc::c_void>(),
            buf.len(),
            offset as libc::off64_t,
        )
    };
    check_len(res)
}

pub fn pwrite(fd: RawFd, buf: &[u8], offset: i64) -> io::Result<usize> {
    // SAFETY: the kernel reads at most `buf.len()` bytes from `buf`.
    let res = unsafe {
        libc::pwrite64(
            fd,
            buf.as_ptr().cast::<libc::c_void>(),
            buf.len(),
            offset as libc::off64_t,
        )
    };
    check_len(res)
}

/// `close(dup(fd))`: drains per-open kernel state without invalidating the
/// open itself.
pub fn flush(fd: RawFd) -> io::Result<()> {
    // SAFETY: no memory is involved; return values are checked.
    let dup = unsafe { libc::dup(fd) };
    if dup == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `dup` is a descriptor we own and close exactly once.
    check_ret(unsafe { libc::close(dup) })
}

pub fn fsync(fd: RawFd, datasync: bool) -> io::Result<()> {
    // SAFETY: no memory is involved; the return value is checked.
    let res = unsafe {
        if datasync {
            libc::fdatasync(fd)
        } else {
            libc::fsync(fd)
        }
    };
    check_ret(res)
}

/// `posix_fallocate` reports its error as the return value, not via errno.
pub fn posix_fallocate(fd: RawFd, offset: i64, length: i64) -> io::Result<()> {
    // SAFETY: no memory is involved; the return value is checked.
    let err = unsafe {
        libc::posix_fallocate64(fd, offset as libc::off64_t, length as libc::off64_t)
    };
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

pub fn flock(fd: RawFd, op: libc::c_int) -> io::Result<()> {
    // SAFETY: no memory is involved; the return value is checked.
    check_ret(unsafe { libc::flock(fd, op) })
}

pub fn fstatvfs(fd: RawFd) -> io::Result<libc::statvfs64> {
    let mut st = MaybeUninit::<libc::statvfs64>::zeroed();
    // SAFETY: the kernel only writes into `st` and we check the return value.
    let res = unsafe { libc::fstatvfs64(fd, st.as_mut_ptr()) };
    check_ret(res)?;
    // SAFETY: a successful fstatvfs64 fully initializes the struct.
    Ok(unsafe { st.assume_init() })
}

pub fn copy_file_range(
    fd_in: RawFd,
    off_in: i64,
    fd_out: RawFd,
    off_out: i64,
    len: usize,
    flags: u32,
) -> io::Result<usize> {
    let mut off_in = off_in as libc::off64_t;
    let mut off_out = off_out as libc::off64_t;
    // SAFETY: the offset pointers are valid for the whole call; the return
    // value is checked.
    let res = unsafe {
        libc::copy_file_range(fd_in, &mut off_in, fd_out, &mut off_out, len, flags as libc::c_uint)
    };
    check_len(res)
}

pub fn getxattr(path: &CStr, name: &CStr, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: the kernel writes at most `buf.len()` bytes into `buf`; a zero
    // length queries the value size without writing.
    let res = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr().cast::<libc::c_void>(),
            buf.len(),
        )
    };
    check_len(res)
}

pub fn listxattr(path: &CStr, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: as in `getxattr`.
    let res = unsafe {
        libc::listxattr(
            path.as_ptr(),
            buf.as_mut_ptr().cast::<libc::c_char>(),
            buf.len(),
        )
    };
    check_len(res)
}

pub fn setxattr(path: &CStr, name: &CStr, value: &[u8], flags: i32) -> io::Result<()> {
    // SAFETY: the kernel reads at most `value.len()` bytes from `value`.
    check_ret(unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast::<libc::c_void>(),
            value.len(),
            flags,
        )
    })
}

pub fn removexattr(path: &CStr, name: &CStr) -> io::Result<()> {
    // SAFETY: both paths are valid NUL-terminated strings.
    check_ret(unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) })
}

/// Clear the process umask; the kernel has already applied the caller's.
pub fn clear_umask() {
    // SAFETY: umask cannot fail and involves no memory.
    unsafe {
        libc::umask(0);
    }
}

/// A connected sequenced-packet Unix socket, or `None` if nobody listens at
/// `path`.
pub fn seqpacket_connect(path: &CStr) -> io::Result<OwnedFd> {
    // SAFETY: no memory is modified; the return value is checked.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by socket and is owned by nobody else.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = sockaddr_un(path)?;
    // SAFETY: `addr` is a fully initialized sockaddr_un and the length passed
    // matches its type.
    let res = unsafe {
        libc::connect(
            sock.as_raw_fd(),
            std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    check_ret(res)?;
    Ok(sock)
}

/// A listening sequenced-packet Unix socket bound at `path`. Used by tests to
/// stand in for the registry.
pub fn seqpacket_listen(path: &CStr) -> io::Result<OwnedFd> {
    // SAFETY: no memory is modified; the return value is checked.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by socket and is owned by nobody else.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = sockaddr_un(path)?;
    // SAFETY: as in `seqpacket_connect`.
    let res = unsafe {
        libc::bind(
            sock.as_raw_fd(),
            std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    check_ret(res)?;
    // SAFETY: no memory is involved; the return value is checked.
    check_ret(unsafe { libc::listen(sock.as_raw_fd(), 1) })?;
    Ok(sock)
}

pub fn accept(listener: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: we pass null for the peer address, which accept permits.
    let fd = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by accept and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: the kernel writes at most `buf.len()` bytes into `buf`.
    let res = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
    check_len(res)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: the kernel reads at most `buf.len()` bytes from `buf`.
    let res = unsafe { libc::write(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len()) };
    check_len(res)
}

/// `send(fd, buf, MSG_NOSIGNAL)`: writing to a peer that disconnected must
/// surface EPIPE, not raise SIGPIPE.
pub fn send_nosignal(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: the kernel reads at most `buf.len()` bytes from `buf`.
    let res = unsafe {
        libc::send(
            fd,
            buf.as_ptr().cast::<libc::c_void>(),
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    check_len(res)
}

fn sockaddr_un(path: &CStr) -> io::Result<libc::sockaddr_un> {
    // SAFETY: sockaddr_un is plain data; an all-zeroes value is valid.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.to_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(addr)
}

/// Detach an `OwnedFd` and hand the raw descriptor to a consumer that takes
/// ownership through the C API (e.g. `fdopendir`).
pub fn into_raw(fd: OwnedFd) -> RawFd {
    fd.into_raw_fd()
}
