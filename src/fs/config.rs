//! Mount-time configuration.
//!
//! All options are per-mount and arrive on the command line; there is no
//! configuration file. Defaults follow the option table in the user-facing
//! help: `source` defaults to `/`, the attribute/entry timeout is derived
//! from the cache policy unless set explicitly, and the shared-version
//! registry endpoints default to their well-known locations.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default location of the shared-version registry socket.
pub const DEFAULT_REGISTRY_SOCKET: &str = "/tmp/ireg.sock";

/// Default location of the memory-mapped shared version table.
pub const DEFAULT_VERSION_TABLE: &str = "/dev/shm/fuse_shared_versions";

/// The caching policy reported to the FUSE client.
///
/// `None` must be selected when file contents may change without the kernel's
/// knowledge (the server does not have exclusive access to the source tree);
/// `Always` should only be selected when it does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Never cache; all I/O is forwarded to the server.
    None,
    /// Close-to-open consistency (the kernel default).
    #[default]
    Auto,
    /// Cache aggressively; nothing invalidates between opens.
    Always,
}

impl CachePolicy {
    /// The attribute/entry timeout used when none was given explicitly.
    pub fn default_timeout(self) -> Duration {
        match self {
            CachePolicy::None => Duration::ZERO,
            CachePolicy::Auto => Duration::from_secs(1),
            CachePolicy::Always => Duration::from_secs(86400),
        }
    }
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CachePolicy::None),
            "auto" => Ok(CachePolicy::Auto),
            "always" => Ok(CachePolicy::Always),
            other => Err(format!(
                "invalid cache policy '{other}' (expected none, auto or always)"
            )),
        }
    }
}

/// Whether readdirplus should be offered to the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReaddirPolicy {
    /// Decide from the cache policy: disabled under `cache=none`.
    #[default]
    Auto,
    /// Requested explicitly.
    Enabled,
    /// Disabled explicitly.
    Disabled,
}

/// Everything the server needs to know about one mount.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host directory served as the root of the mount.
    pub source: PathBuf,
    pub cache: CachePolicy,
    /// Attribute and entry timeout handed to the kernel on every entry reply.
    pub timeout: Duration,
    pub writeback: bool,
    pub flock: bool,
    pub xattr: bool,
    /// Participate in the shared-version registry.
    pub shared: bool,
    /// Fail symlink operations that would require the racy path fallback.
    pub norace: bool,
    pub readdirplus: ReaddirPolicy,
    pub registry_socket: PathBuf,
    pub version_table: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let cache = CachePolicy::default();
        Config {
            source: PathBuf::from("/"),
            cache,
            timeout: cache.default_timeout(),
            writeback: false,
            flock: false,
            xattr: false,
            shared: false,
            norace: false,
            readdirplus: ReaddirPolicy::default(),
            registry_socket: PathBuf::from(DEFAULT_REGISTRY_SOCKET),
            version_table: PathBuf::from(DEFAULT_VERSION_TABLE),
        }
    }
}

impl Config {
    /// Whether readdirplus ends up offered to the kernel.
    ///
    /// Shared mode always disables it (the version protocol has no story for
    /// entries materialized behind the registry's back), as does an explicit
    /// `no_readdirplus`. Under `cache=none` it is disabled unless requested
    /// explicitly.
    pub fn readdirplus_enabled(&self) -> bool {
        if self.shared {
            return false;
        }
        match self.readdirplus {
            ReaddirPolicy::Disabled => false,
            ReaddirPolicy::Enabled => true,
            ReaddirPolicy::Auto => self.cache != CachePolicy::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_defaults_follow_cache_policy() {
        assert_eq!(CachePolicy::None.default_timeout(), Duration::ZERO);
        assert_eq!(CachePolicy::Auto.default_timeout(), Duration::from_secs(1));
        assert_eq!(
            CachePolicy::Always.default_timeout(),
            Duration::from_secs(86400)
        );
    }

    #[test]
    fn cache_policy_parses() {
        assert_eq!("none".parse::<CachePolicy>().unwrap(), CachePolicy::None);
        assert_eq!("auto".parse::<CachePolicy>().unwrap(), CachePolicy::Auto);
        assert_eq!(
            "always".parse::<CachePolicy>().unwrap(),
            CachePolicy::Always
        );
        assert!("sometimes".parse::<CachePolicy>().is_err());
    }

    #[test]
    fn readdirplus_negotiation_matrix() {
        let mut cfg = Config::default();
        assert!(cfg.readdirplus_enabled());

        cfg.cache = CachePolicy::None;
        assert!(!cfg.readdirplus_enabled());

        cfg.readdirplus = ReaddirPolicy::Enabled;
        assert!(cfg.readdirplus_enabled());

        cfg.shared = true;
        assert!(!cfg.readdirplus_enabled(), "shared mode wins over explicit enable");

        cfg.shared = false;
        cfg.readdirplus = ReaddirPolicy::Disabled;
        cfg.cache = CachePolicy::Always;
        assert!(!cfg.readdirplus_enabled());
    }
}
