//! Mount a host directory tree as a passthrough filesystem.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info};

use mirrorfs::fs::fuser::FuserAdapter;
use mirrorfs::fs::{sys, CachePolicy, Config, MirrorFs, ReaddirPolicy};
use mirrorfs::fuse_check;

#[derive(Parser)]
#[command(version, about = "Serve a host directory tree through FUSE.")]
struct Args {
    /// Where to mount the filesystem.
    mountpoint: PathBuf,

    /// Host directory to serve.
    #[arg(long, default_value = "/")]
    source: PathBuf,

    /// Enable writeback caching (requires read access to everything served).
    #[arg(long, overrides_with = "no_writeback")]
    writeback: bool,
    #[arg(long, hide = true, overrides_with = "writeback")]
    no_writeback: bool,

    /// Forward flock locks to the source tree.
    #[arg(long, overrides_with = "no_flock")]
    flock: bool,
    #[arg(long, hide = true, overrides_with = "flock")]
    no_flock: bool,

    /// Serve extended attributes.
    #[arg(long, overrides_with = "no_xattr")]
    xattr: bool,
    #[arg(long, hide = true, overrides_with = "xattr")]
    no_xattr: bool,

    /// Attribute/entry timeout in seconds; defaults per cache policy.
    #[arg(long)]
    timeout: Option<f64>,

    /// Cache policy: none, auto or always.
    #[arg(long, default_value = "auto")]
    cache: String,

    /// Join the shared-version inode registry.
    #[arg(long, overrides_with = "no_shared")]
    shared: bool,
    #[arg(long, hide = true, overrides_with = "shared")]
    no_shared: bool,

    /// Fail symlink operations that would need the racy path fallback.
    #[arg(long)]
    norace: bool,

    /// Force readdirplus on or off.
    #[arg(long, overrides_with = "no_readdirplus")]
    readdirplus: bool,
    #[arg(long, hide = true, overrides_with = "readdirplus")]
    no_readdirplus: bool,

    /// Log at debug level.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Stay in the foreground (the server always does; accepted for
    /// mount-tool compatibility).
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Handle requests on a single worker thread.
    #[arg(long)]
    singlethread: bool,
}

impl Args {
    fn into_config(self) -> Result<(Config, PathBuf, bool), String> {
        let cache: CachePolicy = self.cache.parse()?;

        let timeout = match self.timeout {
            None => cache.default_timeout(),
            Some(secs) if secs >= 0.0 => Duration::from_secs_f64(secs),
            Some(secs) => return Err(format!("timeout is negative ({secs})")),
        };

        let readdirplus = match (self.readdirplus, self.no_readdirplus) {
            (true, _) => ReaddirPolicy::Enabled,
            (_, true) => ReaddirPolicy::Disabled,
            _ => ReaddirPolicy::Auto,
        };

        let cfg = Config {
            source: self.source,
            cache,
            timeout,
            writeback: self.writeback,
            flock: self.flock,
            xattr: self.xattr,
            shared: self.shared,
            norace: self.norace,
            readdirplus,
            ..Config::default()
        };
        Ok((cfg, self.mountpoint, self.singlethread))
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("received ctrl-c, unmounting");
        }
        _ = sigterm.recv() => {
            debug!("received SIGTERM, unmounting");
        }
    }
    Ok(())
}

fn run(cfg: Config, mountpoint: PathBuf, singlethread: bool) -> Result<(), std::io::Error> {
    // The kernel already applied the caller's umask to every create mode.
    sys::clear_umask();

    let fs = Arc::new(MirrorFs::new(cfg)?);

    let runtime = if singlethread {
        tokio::runtime::Builder::new_current_thread()
            .max_blocking_threads(1)
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_multi_thread().enable_all().build()?
    };

    let adapter = FuserAdapter::new(Arc::clone(&fs), runtime.handle().clone());
    let options = [
        fuser::MountOption::FSName("mirrorfs".to_owned()),
        fuser::MountOption::AutoUnmount,
    ];

    info!(
        mountpoint = %mountpoint.display(),
        source = %fs.config().source.display(),
        "mounting"
    );
    let session = fuser::spawn_mount2(adapter, &mountpoint, &options)?;
    info!("serving; press ctrl-c to stop");

    runtime.block_on(wait_for_exit())?;
    drop(session);
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_tracing(args.debug);

    if let Err(e) = fuse_check::ensure_fuse() {
        error!("{e}");
        std::process::exit(1);
    }

    let (cfg, mountpoint, singlethread) = match args.into_config() {
        Ok(parts) => parts,
        Err(msg) => {
            error!("{msg}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cfg, mountpoint, singlethread) {
        error!("mount failed: {e}");
        std::process::exit(1);
    }
}
