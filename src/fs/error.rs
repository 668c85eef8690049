//! Error type shared by all request handlers.

use std::io;

use thiserror::Error;

/// Result alias used throughout the handler surface.
pub type OpResult<T> = Result<T, FsError>;

/// Everything a handler can fail with.
///
/// Host syscall failures carry their errno in [`FsError::Os`]; the remaining
/// variants are the distinct conditions this server originates itself. The
/// `From<FsError> for i32` impl produces the errno that is replied to the
/// kernel.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("i/o error: {0}")]
    Os(#[from] io::Error),

    #[error("failed to resolve a parent directory for the inode")]
    PathResolution,

    #[error("no race-free way to operate on a symlink")]
    SymlinkRace,

    #[error("rename flags are not supported by the host kernel")]
    RenameFlags,

    #[error("fallocate mode is not supported")]
    FallocateMode,

    #[error("extended attributes are disabled")]
    XattrDisabled,

    #[error("link target does not fit the reply buffer")]
    LinkTooLong,

    #[error("directory entry is not tracked by the inode table")]
    UnknownChild,

    #[error("stale node id")]
    StaleNodeId,

    #[error("no mapping backend is configured")]
    MappingUnavailable,

    #[error("mapping request rejected by the transport")]
    MappingFailed,
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        match e {
            FsError::Os(ref io_err) => io_err.raw_os_error().unwrap_or(libc::EIO),
            FsError::PathResolution | FsError::UnknownChild => libc::EIO,
            FsError::SymlinkRace => libc::EPERM,
            FsError::RenameFlags | FsError::MappingFailed => libc::EINVAL,
            FsError::FallocateMode => libc::EOPNOTSUPP,
            FsError::XattrDisabled | FsError::MappingUnavailable => libc::ENOSYS,
            FsError::LinkTooLong => libc::ENAMETOOLONG,
            FsError::StaleNodeId => libc::EBADF,
        }
    }
}

impl FsError {
    /// The last OS error on this thread, captured as an [`FsError::Os`].
    pub fn last_os() -> Self {
        FsError::Os(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_protocol() {
        assert_eq!(i32::from(FsError::PathResolution), libc::EIO);
        assert_eq!(i32::from(FsError::SymlinkRace), libc::EPERM);
        assert_eq!(i32::from(FsError::RenameFlags), libc::EINVAL);
        assert_eq!(i32::from(FsError::FallocateMode), libc::EOPNOTSUPP);
        assert_eq!(i32::from(FsError::XattrDisabled), libc::ENOSYS);
        assert_eq!(i32::from(FsError::LinkTooLong), libc::ENAMETOOLONG);
    }

    #[test]
    fn os_errors_keep_their_errno() {
        let e = FsError::Os(io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(i32::from(e), libc::ENOENT);
    }
}
