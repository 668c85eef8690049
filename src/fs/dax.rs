//! DAX mapping hook.
//!
//! Mapping a file region directly into the client's address space is the
//! transport's business: the server only decides which descriptor and which
//! protection to hand over. Transports that support it (virtio-style DAX
//! windows) implement [`MappingBackend`]; everything else leaves it
//! unconfigured and the mapping operations report ENOSYS.

use std::io;
use std::os::fd::BorrowedFd;

use bitflags::bitflags;

bitflags! {
    /// Protection requested for a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u64 {
        const READ = 1;
        const WRITE = 1 << 1;
    }
}

/// The transport-side implementation of map/unmap.
pub trait MappingBackend: Send + Sync {
    /// Map `len` bytes of `fd` starting at `file_offset` into the shared
    /// window at `mem_offset`.
    fn map(
        &self,
        fd: BorrowedFd<'_>,
        file_offset: u64,
        len: u64,
        mem_offset: u64,
        flags: MappingFlags,
    ) -> io::Result<()>;

    /// Undo a previous mapping of `len` bytes at `mem_offset`.
    fn unmap(&self, mem_offset: u64, len: u64) -> io::Result<()>;
}

/// Reads are always mapped; writes only when the open asked for them.
pub fn flags_for_open(open_flags: u64) -> MappingFlags {
    let mut flags = MappingFlags::READ;
    if open_flags & libc::O_WRONLY as u64 != 0 {
        flags |= MappingFlags::WRITE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_opens_request_write_mappings() {
        assert_eq!(flags_for_open(libc::O_RDONLY as u64), MappingFlags::READ);
        assert_eq!(
            flags_for_open(libc::O_WRONLY as u64),
            MappingFlags::READ | MappingFlags::WRITE
        );
    }
}
