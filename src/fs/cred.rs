//! Per-thread credential switching for create-type operations.
//!
//! Files must be created with the ownership of the requesting client, so the
//! handler briefly adopts the caller's effective uid/gid around the host
//! syscall. POSIX requires all threads of a process to share credentials and
//! libc enforces that with a signal broadcast, which would leak the switch
//! into unrelated worker threads; the raw `setres[ug]id` syscalls change only
//! the calling thread, so we invoke them directly.
//!
//! A server left running with someone else's credentials is unrecoverable,
//! so a failed restore aborts the process.

use std::io;

use tracing::error;

use super::RequestContext;

/// Restores the thread's effective gid on drop.
#[derive(Debug)]
pub struct ScopedGid {
    old: libc::gid_t,
}

impl ScopedGid {
    fn switch(gid: libc::gid_t, old: libc::gid_t) -> io::Result<Option<Self>> {
        if gid == old {
            return Ok(None);
        }
        // SAFETY: setresgid modifies no memory and the return value is
        // checked.
        let res = unsafe { libc::syscall(libc::SYS_setresgid, -1, gid, -1) };
        if res == 0 {
            Ok(Some(ScopedGid { old }))
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Drop for ScopedGid {
    fn drop(&mut self) {
        // SAFETY: as in `switch`.
        let res = unsafe { libc::syscall(libc::SYS_setresgid, -1, self.old, -1) };
        if res != 0 {
            error!(
                gid = self.old,
                "failed to restore effective gid: {}",
                io::Error::last_os_error()
            );
            std::process::abort();
        }
    }
}

/// Restores the thread's effective uid on drop.
#[derive(Debug)]
pub struct ScopedUid {
    old: libc::uid_t,
}

impl ScopedUid {
    fn switch(uid: libc::uid_t, old: libc::uid_t) -> io::Result<Option<Self>> {
        if uid == old {
            return Ok(None);
        }
        // SAFETY: setresuid modifies no memory and the return value is
        // checked.
        let res = unsafe { libc::syscall(libc::SYS_setresuid, -1, uid, -1) };
        if res == 0 {
            Ok(Some(ScopedUid { old }))
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Drop for ScopedUid {
    fn drop(&mut self) {
        // SAFETY: as in `switch`.
        let res = unsafe { libc::syscall(libc::SYS_setresuid, -1, self.old, -1) };
        if res != 0 {
            error!(
                uid = self.old,
                "failed to restore effective uid: {}",
                io::Error::last_os_error()
            );
            std::process::abort();
        }
    }
}

/// Caller credentials held for the duration of one host syscall.
///
/// Field order matters: the uid guard drops (and restores) before the gid
/// guard, mirroring the reverse of the acquisition order.
#[derive(Debug)]
pub struct Credentials {
    _uid: Option<ScopedUid>,
    _gid: Option<ScopedGid>,
}

/// Adopt the caller's effective uid/gid on this thread.
///
/// The gid switches first: dropping uid privileges first could cost us the
/// capability to change the gid at all. If the uid switch fails the gid guard
/// drops on the error path and rolls the gid back before the error returns.
pub fn become_caller(ctx: &RequestContext) -> io::Result<Credentials> {
    // SAFETY: geteuid/getegid cannot fail and modify no memory.
    let (old_uid, old_gid) = unsafe { (libc::geteuid(), libc::getegid()) };

    let gid = ScopedGid::switch(ctx.gid, old_gid)?;
    let uid = ScopedUid::switch(ctx.uid, old_uid)?;
    Ok(Credentials {
        _uid: uid,
        _gid: gid,
    })
}
