//! The passthrough filesystem core.
//!
//! Modules are layered bottom-up: [`sys`] wraps the raw host syscalls,
//! [`inode`] owns the canonical inode table, [`resolver`], [`cred`],
//! [`registry`] and [`dirstream`] provide the supporting machinery, and
//! [`passthrough`] composes them into the request-handler surface that
//! [`fuser`] (the adapter, not the crate) exposes to the kernel transport.

pub mod config;
pub mod cred;
pub mod dax;
pub mod dirstream;
pub mod error;
pub mod fuser;
pub mod inode;
pub mod passthrough;
pub mod registry;
pub mod resolver;
pub mod sys;

pub use config::{CachePolicy, Config, ReaddirPolicy};
pub use error::FsError;
pub use inode::{InodeKey, NodeId, ROOT_ID};
pub use passthrough::MirrorFs;

/// Credentials of the client that issued the current request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
}
