//! Mount binary: project an overlay-backed workspace at a mountpoint.

use anyhow::Context;
use canopy_core::{Hash, MemoryObjectStore, Overlay};
use canopy_fuse::{spawn_mount, Mount, MountConfig};
use clap::Parser;
use fuser::MountOption;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "canopyfs", about = "Mount a lazily-projected workspace")]
struct Args {
    /// Directory holding the overlay (local modifications).
    overlay: PathBuf,
    /// Where to mount the filesystem.
    mountpoint: PathBuf,
    /// Source-control tree to project at the root, as a hex hash.
    #[arg(long)]
    root_tree: Option<String>,
    /// Kernel attribute/entry cache TTL in seconds.
    #[arg(long, default_value_t = 1)]
    cache_ttl: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let root_tree = args
        .root_tree
        .as_deref()
        .map(Hash::from_hex)
        .transpose()
        .context("invalid --root-tree hash")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    let overlay = Overlay::open(&args.overlay).context("failed to open overlay")?;
    let config = MountConfig {
        attr_ttl: std::time::Duration::from_secs(args.cache_ttl),
        entry_ttl: std::time::Duration::from_secs(args.cache_ttl),
        ..MountConfig::default()
    };

    let store = Arc::new(MemoryObjectStore::new());
    let mount = runtime
        .block_on(Mount::open(store, overlay, config, root_tree))
        .context("failed to open mount")?;

    let options = [
        MountOption::FSName("canopyfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ];
    let session = spawn_mount(mount, &args.mountpoint, &options)
        .context("failed to mount filesystem")?;
    info!(mountpoint = %args.mountpoint.display(), "mounted");

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed waiting for interrupt")?;
    info!("unmounting");
    drop(session);
    Ok(())
}
