//! The mount-wide singleton.
//!
//! A [`Mount`] owns the external collaborators (object store, overlay,
//! journal), the inode map, the rename lock, and the two fixed inodes: the
//! root and the reserved sentinel directory. Inodes reach all of this
//! through a shared [`MountInner`]; the inner state never owns inodes
//! strongly (the map keeps weak pointers), so ownership flows in exactly
//! one direction: `Mount` → root → entry tables → children.

use crate::config::MountConfig;
use crate::error::{FsError, FsResult};
use crate::fs_bug;
use crate::inode::map::InodeMap;
use crate::inode::tree::{DirContents, TreeInode};
use crate::inode::{FileInode, InodePtr};
use crate::request::RequestContext;
use canopy_core::{
    Hash, InodeNumber, Journal, ObjectStore, Overlay, PathComponent, RelativePath,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, OnceLock};
use tokio::sync::MutexGuard;
use tracing::info;

/// Name of the reserved sentinel directory directly under the root.
pub const RESERVED_NAME: &str = ".canopy";

/// Guard of the mount-wide rename lock: serializes rename, remove,
/// checkout and every materialization state transition.
pub type RenameLockGuard<'a> = MutexGuard<'a, ()>;

/// Kernel cache-invalidation callback, injected by the bridge after the
/// session is spawned. Operations originating from kernel requests never
/// call it; the kernel updates its own caches for those.
pub trait InvalidationSink: Send + Sync {
    fn invalidate_entry(&self, parent: InodeNumber, name: &PathComponent);
}

pub(crate) struct MountInner {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) overlay: Arc<Overlay>,
    pub(crate) journal: Journal,
    pub(crate) inode_map: InodeMap,
    pub(crate) rename_lock: tokio::sync::Mutex<()>,
    pub(crate) config: MountConfig,
    invalidator: OnceLock<Box<dyn InvalidationSink>>,
}

impl MountInner {
    pub(crate) fn invalidate_entry(&self, parent: InodeNumber, name: &PathComponent) {
        if let Some(sink) = self.invalidator.get() {
            sink.invalidate_entry(parent, name);
        }
    }
}

pub struct Mount {
    inner: Arc<MountInner>,
    root: Arc<TreeInode>,
    reserved: Arc<TreeInode>,
}

impl Mount {
    /// Open a mount over `store` and `overlay`.
    ///
    /// A materialized root listing in the overlay takes precedence;
    /// otherwise the root projects `initial_tree` (or starts empty and
    /// materialized when none is given).
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        overlay: Overlay,
        config: MountConfig,
        initial_tree: Option<Hash>,
    ) -> FsResult<Arc<Mount>> {
        let overlay = Arc::new(overlay);
        let inode_map = InodeMap::new(Arc::clone(&overlay))?;
        let inner = Arc::new(MountInner {
            store,
            overlay,
            journal: Journal::new(),
            inode_map,
            rename_lock: tokio::sync::Mutex::new(()),
            config,
            invalidator: OnceLock::new(),
        });

        let root_contents = match inner.overlay.load_dir(InodeNumber::ROOT)? {
            Some(dir) => DirContents::from_overlay(dir),
            None => match initial_tree {
                Some(hash) => {
                    let tree = inner.store.get_tree(hash).await?;
                    DirContents::from_tree(&tree)
                }
                None => DirContents::empty_materialized(),
            },
        };
        let root = TreeInode::new(Arc::clone(&inner), InodeNumber::ROOT, None, root_contents);
        let reserved = TreeInode::new(
            Arc::clone(&inner),
            InodeNumber::RESERVED,
            Some((InodeNumber::ROOT, reserved_name())),
            DirContents::empty_materialized(),
        );
        inner
            .inode_map
            .register_loaded(&InodePtr::Tree(Arc::clone(&root)));
        inner
            .inode_map
            .register_loaded(&InodePtr::Tree(Arc::clone(&reserved)));

        info!(
            root_tree = %initial_tree.map(|h| h.to_hex()).unwrap_or_else(|| "overlay".into()),
            "mount opened"
        );
        Ok(Arc::new(Mount {
            inner,
            root,
            reserved,
        }))
    }

    pub fn root(&self) -> &Arc<TreeInode> {
        &self.root
    }

    pub fn reserved(&self) -> &Arc<TreeInode> {
        &self.reserved
    }

    pub fn journal(&self) -> &Journal {
        &self.inner.journal
    }

    pub fn overlay(&self) -> &Overlay {
        &self.inner.overlay
    }

    pub fn config(&self) -> &MountConfig {
        &self.inner.config
    }

    /// Install the kernel invalidation callback. Later calls are ignored;
    /// the bridge wires this exactly once after spawning the session.
    pub fn set_invalidation_sink(&self, sink: Box<dyn InvalidationSink>) {
        let _ = self.inner.invalidator.set(sink);
    }

    pub async fn acquire_rename_lock(&self) -> RenameLockGuard<'_> {
        self.inner.rename_lock.lock().await
    }

    /// Whether an inode object currently exists for `number`.
    pub fn is_loaded(&self, number: InodeNumber) -> bool {
        self.inner.inode_map.is_loaded(number)
    }

    /// Resolve an inode by number, loading it if necessary.
    ///
    /// When the inode is not loaded, the parent-chain record captured at
    /// load time is walked until a loaded ancestor is found, and the chain
    /// is then loaded downward with ordinary child lookups.
    pub fn lookup_inode(
        self: &Arc<Self>,
        number: InodeNumber,
    ) -> BoxFuture<'static, FsResult<InodePtr>> {
        let this = Arc::clone(self);
        async move {
            if let Some(ptr) = this.inner.inode_map.get_loaded(number) {
                return Ok(ptr);
            }
            let Some(record) = this.inner.inode_map.record_for(number) else {
                return Err(FsError::Stale);
            };
            let parent = this.lookup_inode(record.parent).await?;
            let parent = parent.as_tree().ok_or_else(|| {
                fs_bug!("parent record of inode {} is not a directory", number)
            })?;
            let ctx = RequestContext::internal();
            let child = parent.get_or_load_child(&record.name, &ctx).await?;
            if child.number() != number {
                // The name now resolves to a different inode; the number
                // the kernel remembered is gone.
                return Err(FsError::Stale);
            }
            Ok(child)
        }
        .boxed()
    }

    pub async fn lookup_tree_inode(
        self: &Arc<Self>,
        number: InodeNumber,
    ) -> FsResult<Arc<TreeInode>> {
        self.lookup_inode(number)
            .await?
            .as_tree()
            .ok_or(FsError::NotDir)
    }

    pub async fn lookup_file_inode(
        self: &Arc<Self>,
        number: InodeNumber,
    ) -> FsResult<Arc<FileInode>> {
        self.lookup_inode(number)
            .await?
            .as_file()
            .ok_or(FsError::IsDir)
    }

    /// The kernel forgot `count` references to `number`; unload the inode
    /// if nothing else holds it.
    pub async fn forget(&self, number: InodeNumber, count: u64) {
        if let Some(candidate) = self.inner.inode_map.dec_fuse_refcount(number, count) {
            self.inner.inode_map.try_unload(candidate).await;
        }
    }

    /// Resolve a path from the root, loading inodes along the way.
    pub async fn resolve(self: &Arc<Self>, path: &RelativePath) -> FsResult<InodePtr> {
        let ctx = RequestContext::internal();
        self.root.get_child_recursive(path, &ctx).await
    }

    pub(crate) fn inner(&self) -> &Arc<MountInner> {
        &self.inner
    }
}

fn reserved_name() -> PathComponent {
    // The constant is a valid component by construction.
    PathComponent::new(RESERVED_NAME).unwrap_or_else(|_| unreachable!())
}
