//! FUSE availability checks.

use std::path::Path;

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The FUSE character device is absent.
    #[error(
        "/dev/fuse is missing. The fuse kernel module is not loaded.\n\
         Load it with: modprobe fuse"
    )]
    DeviceMissing,
}

/// Verify that FUSE is usable before attempting to mount.
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if Path::new("/dev/fuse").exists() {
        Ok(())
    } else {
        Err(FuseCheckError::DeviceMissing)
    }
}
