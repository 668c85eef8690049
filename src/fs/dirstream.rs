//! Offset-seekable directory streams.
//!
//! One stream exists per opendir handle. It owns the `DIR*`, the last entry
//! read but not yet committed to a reply, and the offset that entry was read
//! at, so a readdir that stopped mid-buffer resumes exactly where it left
//! off. The transport serializes calls per handle; the stream itself is not
//! thread-safe.

use std::ffi::{CStr, CString};
use std::io;
#[cfg(test)]
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::ptr::NonNull;

use super::sys;

/// One entry as reported by the host, decoupled from the dirent buffer.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub ino: u64,
    /// Offset of the *next* entry (`d_off`); becomes the client's
    /// continuation cookie.
    pub next_offset: i64,
    /// Host `DT_*` type byte.
    pub type_: u8,
    pub name: CString,
}

impl StreamEntry {
    pub fn is_dot_or_dotdot(&self) -> bool {
        let n = self.name.to_bytes();
        n == b"." || n == b".."
    }
}

/// A streaming cursor over one open directory.
pub struct DirStream {
    dir: NonNull<libc::DIR>,
    entry: Option<StreamEntry>,
    offset: i64,
}

// SAFETY: the DIR* is owned exclusively by this stream and the transport
// never calls into the same handle from two threads at once; moving the
// stream between threads is fine.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Open `dirfd/.` read-only and wrap it as a stream positioned at 0.
    pub fn open(dirfd: RawFd) -> io::Result<Self> {
        let fd = sys::openat(dirfd, c".", libc::O_RDONLY | libc::O_CLOEXEC)?;

        let raw = sys::into_raw(fd);
        // SAFETY: `raw` is a valid directory descriptor; on success fdopendir
        // owns it, on failure we close it ourselves.
        let dir = unsafe { libc::fdopendir(raw) };
        let Some(dir) = NonNull::new(dir) else {
            let err = io::Error::last_os_error();
            // SAFETY: fdopendir did not take ownership on failure.
            unsafe {
                libc::close(raw);
            }
            return Err(err);
        };

        Ok(DirStream {
            dir,
            entry: None,
            offset: 0,
        })
    }

    /// The underlying directory descriptor (for fsyncdir).
    pub fn raw_fd(&self) -> RawFd {
        // SAFETY: the DIR* is valid for the lifetime of the stream.
        unsafe { libc::dirfd(self.dir.as_ptr()) }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Reposition the stream if the client resumed somewhere else, dropping
    /// any cached entry.
    pub fn seek(&mut self, offset: i64) {
        if offset != self.offset {
            // SAFETY: the DIR* is valid and seekdir accepts any cookie
            // previously produced by this stream (or 0).
            unsafe { libc::seekdir(self.dir.as_ptr(), offset) };
            self.entry = None;
            self.offset = offset;
        }
    }

    /// The entry under the cursor, reading one from the host if none is
    /// cached. `Ok(None)` is end-of-stream.
    pub fn next(&mut self) -> io::Result<Option<StreamEntry>> {
        if self.entry.is_none() {
            // SAFETY: errno is thread-local; clearing it is how readdir
            // distinguishes end-of-stream from failure.
            unsafe { *libc::__errno_location() = 0 };
            // SAFETY: the DIR* is valid; the returned dirent is only read
            // before the next readdir call on this stream.
            let ent = unsafe { libc::readdir64(self.dir.as_ptr()) };
            if ent.is_null() {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(0) => Ok(None),
                    _ => Err(err),
                };
            }
            // SAFETY: readdir64 returned a valid dirent whose d_name is
            // NUL-terminated.
            let (ino, off, type_, name) = unsafe {
                (
                    (*ent).d_ino,
                    (*ent).d_off,
                    (*ent).d_type,
                    CStr::from_ptr((*ent).d_name.as_ptr()).to_owned(),
                )
            };
            self.entry = Some(StreamEntry {
                ino,
                next_offset: off,
                type_,
                name,
            });
        }
        Ok(self.entry.clone())
    }

    /// Commit the cached entry: the cursor advances to its `next_offset`.
    pub fn consume(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.offset = entry.next_offset;
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        // SAFETY: the DIR* was obtained from fdopendir and is closed exactly
        // once.
        unsafe {
            libc::closedir(self.dir.as_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn open_stream(path: &std::path::Path) -> DirStream {
        let c = sys::to_cstring(path.as_os_str()).unwrap();
        let fd = sys::open(&c, libc::O_PATH | libc::O_CLOEXEC).unwrap();
        // The stream dups the directory via `openat(fd, ".")`, so the O_PATH
        // anchor can drop right away.
        DirStream::open(fd.as_raw_fd()).unwrap()
    }

    fn names(stream: &mut DirStream) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(e) = stream.next().unwrap() {
            if !e.is_dot_or_dotdot() {
                out.push(e.name.to_string_lossy().into_owned());
            }
            stream.consume();
        }
        out
    }

    #[test]
    fn enumerates_every_entry_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["a", "b", "c"] {
            std::fs::write(dir.path().join(n), b"").unwrap();
        }
        let mut stream = open_stream(dir.path());

        let seen: BTreeSet<_> = names(&mut stream).into_iter().collect();
        assert_eq!(seen, BTreeSet::from(["a".into(), "b".into(), "c".into()]));
    }

    #[test]
    fn seek_resumes_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            std::fs::write(dir.path().join(format!("f{i:02}")), b"").unwrap();
        }
        let mut stream = open_stream(dir.path());

        // Read half, remember the cursor, then resume on a fresh stream.
        let mut first_half = Vec::new();
        for _ in 0..11 {
            let e = stream.next().unwrap().expect("enough entries");
            if !e.is_dot_or_dotdot() {
                first_half.push(e.name.to_string_lossy().into_owned());
            }
            stream.consume();
        }
        let cursor = stream.offset();

        let mut resumed = open_stream(dir.path());
        resumed.seek(cursor);
        let rest = names(&mut resumed);

        let mut all: Vec<_> = first_half.into_iter().chain(rest).collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total, "no entry may be reported twice");
        assert_eq!(total, 20);
    }

    #[test]
    fn uncommitted_entry_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("only"), b"").unwrap();
        let mut stream = open_stream(dir.path());

        let a = stream.next().unwrap().unwrap();
        let b = stream.next().unwrap().unwrap();
        assert_eq!(a.name, b.name, "peeking twice yields the cached entry");
    }
}
