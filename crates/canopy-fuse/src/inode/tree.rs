//! Directory inodes.
//!
//! Each tree inode owns a [`DirContents`] behind a reader/writer lock (the
//! "contents lock"). Whenever that lock is not held exclusively:
//! - `entries` is consistent with `tree_hash`: a `tree_hash` means this
//!   directory is byte-identical to that source-control tree, and its
//!   absence means the authoritative listing is persisted in the overlay;
//! - every loaded child's recorded parent and name match its slot here.
//!
//! Mutations follow a common shape: materialize self (which takes the
//! mount-wide rename lock), take the contents write lock, mutate, persist
//! the overlay listing, release, then invalidate kernel caches and journal.

use crate::error::{FsError, FsResult};
use crate::fs_bug;
use crate::inode::file::{self, FileInode};
use crate::inode::{loaded_parent_of, InodeAttr, InodeCore, InodePtr};
use crate::mount::{MountInner, RenameLockGuard, RESERVED_NAME};
use crate::request::RequestContext;
use canopy_core::{
    Hash, InodeNumber, JournalChange, OverlayDir, OverlayEntry, PathComponent, RelativePath,
    Timestamps, Tree, TreeEntry,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock, RwLockWriteGuard};
use tracing::{debug, trace, warn};

/// One child slot of a directory.
#[derive(Clone)]
pub(crate) struct DirEntry {
    pub mode: u32,
    /// Stable identity once assigned; persisted when the parent is
    /// materialized.
    pub inode_number: Option<InodeNumber>,
    /// Source-control object this child matches. `None` means the child is
    /// materialized and its bytes/listing live in the overlay.
    pub hash: Option<Hash>,
    /// The in-memory inode object, when loaded.
    pub loaded: Option<InodePtr>,
}

impl DirEntry {
    pub(crate) fn from_tree_entry(entry: &TreeEntry) -> Self {
        DirEntry {
            mode: entry.kind.initial_mode(),
            inode_number: None,
            hash: Some(entry.hash),
            loaded: None,
        }
    }

    pub(crate) fn materialized(mode: u32, number: InodeNumber) -> Self {
        DirEntry {
            mode,
            inode_number: Some(number),
            hash: None,
            loaded: None,
        }
    }

    pub(crate) fn is_directory(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    pub(crate) fn is_materialized(&self) -> bool {
        self.hash.is_none()
    }
}

/// The mutable state of one directory.
pub(crate) struct DirContents {
    pub entries: BTreeMap<PathComponent, DirEntry>,
    /// Source-control tree this directory matches; `None` ⇔ materialized.
    pub tree_hash: Option<Hash>,
    pub timestamps: Timestamps,
}

impl DirContents {
    pub(crate) fn from_tree(tree: &Tree) -> Self {
        let entries = tree
            .entries()
            .iter()
            .map(|e| (e.name.clone(), DirEntry::from_tree_entry(e)))
            .collect();
        DirContents {
            entries,
            tree_hash: Some(tree.hash()),
            timestamps: Timestamps::now(),
        }
    }

    pub(crate) fn empty_materialized() -> Self {
        DirContents {
            entries: BTreeMap::new(),
            tree_hash: None,
            timestamps: Timestamps::now(),
        }
    }

    pub(crate) fn from_overlay(dir: OverlayDir) -> Self {
        let entries = dir
            .entries
            .into_iter()
            .map(|(name, e)| {
                (
                    name,
                    DirEntry {
                        mode: e.mode,
                        inode_number: e.inode_number,
                        hash: e.hash,
                        loaded: None,
                    },
                )
            })
            .collect();
        DirContents {
            entries,
            tree_hash: dir.tree_hash,
            timestamps: dir.timestamps,
        }
    }

    pub(crate) fn to_overlay(&self) -> OverlayDir {
        OverlayDir {
            timestamps: self.timestamps,
            tree_hash: self.tree_hash,
            entries: self
                .entries
                .iter()
                .map(|(name, e)| {
                    (
                        name.clone(),
                        OverlayEntry {
                            mode: e.mode,
                            inode_number: e.inode_number,
                            hash: e.hash,
                        },
                    )
                })
                .collect(),
        }
    }

    pub(crate) fn is_materialized(&self) -> bool {
        self.tree_hash.is_none()
    }
}

/// One entry of a directory listing snapshot.
#[derive(Debug, Clone)]
pub struct DirListEntry {
    pub name: PathComponent,
    /// Zero when no inode number has been assigned yet; the kernel resolves
    /// real numbers through lookup.
    pub ino: u64,
    pub mode: u32,
}

pub struct TreeInode {
    core: InodeCore,
    pub(crate) contents: Arc<RwLock<DirContents>>,
}

impl std::fmt::Debug for TreeInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TreeInode").field(&self.core.number()).finish()
    }
}

enum DirLoadPlan {
    FetchTree { number: InodeNumber, hash: Hash },
    LoadOverlay { number: InodeNumber },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveKind {
    File,
    Dir,
}

const MAX_REMOVE_RETRIES: u32 = 3;

impl TreeInode {
    pub(crate) fn new(
        mount: Arc<MountInner>,
        number: InodeNumber,
        parent: Option<(InodeNumber, PathComponent)>,
        contents: DirContents,
    ) -> Arc<Self> {
        Arc::new(TreeInode {
            core: InodeCore::new(mount, number, parent),
            contents: Arc::new(RwLock::new(contents)),
        })
    }

    pub fn core(&self) -> &InodeCore {
        &self.core
    }

    pub(crate) async fn contents_write(&self) -> RwLockWriteGuard<'_, DirContents> {
        self.contents.write().await
    }

    pub async fn getattr(&self) -> InodeAttr {
        let contents = self.contents.read().await;
        InodeAttr {
            ino: self.core.number().get(),
            size: 0,
            mode: libc::S_IFDIR as u32 | 0o755,
            // "." and ".." plus one per entry.
            nlink: contents.entries.len() as u32 + 2,
            timestamps: contents.timestamps,
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.contents.read().await.entries.is_empty()
    }

    pub async fn is_materialized(&self) -> bool {
        self.contents.read().await.is_materialized()
    }

    /// The source-control tree hash this directory matches, if unmodified.
    pub async fn tree_hash(&self) -> Option<Hash> {
        self.contents.read().await.tree_hash
    }

    /// Snapshot listing for readdir.
    pub async fn readdir(&self) -> Vec<DirListEntry> {
        let contents = self.contents.read().await;
        contents
            .entries
            .iter()
            .map(|(name, e)| DirListEntry {
                name: name.clone(),
                ino: e.inode_number.map(InodeNumber::get).unwrap_or(0),
                mode: e.mode,
            })
            .collect()
    }

    // ---- lookup and lazy loading ----------------------------------------

    /// Resolve the child `name`, loading its inode if necessary.
    ///
    /// At most one load per inode number is ever in flight: the inode map
    /// decides whether this call starts the load or joins an existing one.
    /// Waiters registered here are completed only after the contents lock
    /// is released.
    pub async fn get_or_load_child(
        self: &Arc<Self>,
        name: &PathComponent,
        ctx: &RequestContext,
    ) -> FsResult<InodePtr> {
        ctx.check_interrupt()?;
        let mount = Arc::clone(self.core.mount());

        let (rx, plan, ready) = {
            let mut contents = self.contents.write().await;
            let Some(entry) = contents.entries.get_mut(name) else {
                if self.core.number() == InodeNumber::ROOT && name.as_str() == RESERVED_NAME {
                    return mount
                        .inode_map
                        .get_loaded(InodeNumber::RESERVED)
                        .ok_or_else(|| fs_bug!("reserved inode is not loaded"));
                }
                trace!(
                    parent = %self.core.log_path(),
                    name = name.as_str(),
                    "lookup of non-existent entry"
                );
                return Err(FsError::NotFound);
            };
            if let Some(ptr) = &entry.loaded {
                return Ok(ptr.clone());
            }

            let number = match entry.inode_number {
                Some(n) => n,
                None => {
                    let n = mount.inode_map.allocate_inode_number()?;
                    entry.inode_number = Some(n);
                    n
                }
            };

            let (tx, rx) = oneshot::channel();
            let start_load =
                mount
                    .inode_map
                    .should_load_child(self.core.number(), name, number, tx);
            if !start_load {
                (rx, None, None)
            } else if !entry.is_directory() {
                // Non-directory loads are immediate: all state needed to
                // build the inode is already in the entry.
                let ptr = InodePtr::File(FileInode::new(
                    Arc::clone(&mount),
                    number,
                    self.core.number(),
                    name.clone(),
                    entry.mode,
                    entry.hash,
                ));
                entry.loaded = Some(ptr.clone());
                let waiters = mount.inode_map.inode_load_complete(&ptr);
                (rx, None, Some((ptr, waiters)))
            } else if let Some(hash) = entry.hash {
                (rx, Some(DirLoadPlan::FetchTree { number, hash }), None)
            } else {
                (rx, Some(DirLoadPlan::LoadOverlay { number }), None)
            }
        };

        // Contents lock released: fulfill synchronously completed loads,
        // or run the asynchronous directory load.
        if let Some((ptr, waiters)) = ready {
            for waiter in waiters {
                let _ = waiter.send(Ok(ptr.clone()));
            }
        } else if let Some(plan) = plan {
            self.finish_dir_load(name, plan).await;
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(fs_bug!(
                "inode load for {:?} in {} completed without notifying waiters",
                name,
                self.core.log_path()
            )),
        }
    }

    /// Complete an asynchronous directory load and notify every waiter.
    async fn finish_dir_load(self: &Arc<Self>, name: &PathComponent, plan: DirLoadPlan) {
        let mount = Arc::clone(self.core.mount());
        let (number, loaded) = match plan {
            DirLoadPlan::FetchTree { number, hash } => {
                let result = mount
                    .store
                    .get_tree(hash)
                    .await
                    .map(|tree| DirContents::from_tree(&tree))
                    .map_err(FsError::from);
                (number, result)
            }
            DirLoadPlan::LoadOverlay { number } => {
                let result = match mount.overlay.load_dir(number) {
                    Ok(Some(dir)) => Ok(DirContents::from_overlay(dir)),
                    Ok(None) => Err(fs_bug!(
                        "materialized directory {} has no overlay data",
                        number
                    )),
                    Err(e) => Err(e.into()),
                };
                (number, result)
            }
        };

        match loaded {
            Err(e) => {
                mount.inode_map.inode_load_failed(number, &e.to_string());
            }
            Ok(dir) => {
                let tree = TreeInode::new(
                    Arc::clone(&mount),
                    number,
                    Some((self.core.number(), name.clone())),
                    dir,
                );
                let ptr = InodePtr::Tree(tree);
                let waiters = {
                    let mut contents = self.contents.write().await;
                    match contents.entries.get_mut(name) {
                        Some(entry) if entry.inode_number == Some(number) => {
                            entry.loaded = Some(ptr.clone());
                        }
                        _ => {
                            // The entry was removed or replaced while the
                            // load was in flight: the inode exists but is
                            // already unlinked.
                            warn!(
                                parent = %self.core.log_path(),
                                name = name.as_str(),
                                ino = number.get(),
                                "entry disappeared during load"
                            );
                            ptr.core().mark_unlinked();
                        }
                    }
                    mount.inode_map.inode_load_complete(&ptr)
                };
                for waiter in waiters {
                    let _ = waiter.send(Ok(ptr.clone()));
                }
            }
        }
    }

    /// Like [`get_or_load_child`](Self::get_or_load_child) but requires a
    /// directory.
    pub async fn get_or_load_child_tree(
        self: &Arc<Self>,
        name: &PathComponent,
        ctx: &RequestContext,
    ) -> FsResult<Arc<TreeInode>> {
        let child = self.get_or_load_child(name, ctx).await?;
        child.as_tree().ok_or(FsError::NotDir)
    }

    /// Walk `path`, loading a tree for every non-terminal component.
    pub async fn get_child_recursive(
        self: &Arc<Self>,
        path: &RelativePath,
        ctx: &RequestContext,
    ) -> FsResult<InodePtr> {
        let components: Vec<PathComponent> = path
            .components()
            .map(PathComponent::new)
            .collect::<Result<_, _>>()
            .map_err(|_| FsError::Invalid)?;
        let Some((last, parents)) = components.split_last() else {
            return Ok(InodePtr::Tree(Arc::clone(self)));
        };
        let mut current = Arc::clone(self);
        for name in parents {
            current = current.get_or_load_child_tree(name, ctx).await?;
        }
        current.get_or_load_child(last, ctx).await
    }

    // ---- create / mkdir / mknod / symlink -------------------------------

    /// Create a regular file. A name collision here is an internal bug:
    /// the kernel layer deduplicates concurrent creates.
    pub async fn create(
        self: &Arc<Self>,
        name: &PathComponent,
        permissions: u32,
        ctx: &RequestContext,
    ) -> FsResult<Arc<FileInode>> {
        let mode = libc::S_IFREG as u32 | (permissions & 0o7777);
        let ptr = self
            .create_child(name, mode, NewChild::File(Vec::new()), true, ctx)
            .await?;
        file::expect_file(ptr)
    }

    pub async fn mkdir(
        self: &Arc<Self>,
        name: &PathComponent,
        permissions: u32,
        ctx: &RequestContext,
    ) -> FsResult<Arc<TreeInode>> {
        let mode = libc::S_IFDIR as u32 | (permissions & 0o7777);
        let ptr = self
            .create_child(name, mode, NewChild::Dir, false, ctx)
            .await?;
        ptr.as_tree()
            .ok_or_else(|| fs_bug!("mkdir produced a non-directory inode"))
    }

    pub async fn symlink(
        self: &Arc<Self>,
        name: &PathComponent,
        target: &[u8],
        ctx: &RequestContext,
    ) -> FsResult<Arc<FileInode>> {
        let mode = libc::S_IFLNK as u32 | 0o777;
        let ptr = self
            .create_child(name, mode, NewChild::File(target.to_vec()), false, ctx)
            .await?;
        file::expect_file(ptr)
    }

    /// mknod is permitted only for unix-domain sockets; everything else
    /// has no representation in source control.
    pub async fn mknod(
        self: &Arc<Self>,
        name: &PathComponent,
        mode: u32,
        ctx: &RequestContext,
    ) -> FsResult<Arc<FileInode>> {
        if mode & libc::S_IFMT as u32 != libc::S_IFSOCK as u32 {
            return Err(FsError::NotPermitted);
        }
        let mode = libc::S_IFSOCK as u32 | (mode & 0o7777);
        let ptr = self
            .create_child(name, mode, NewChild::File(Vec::new()), false, ctx)
            .await?;
        file::expect_file(ptr)
    }

    async fn create_child(
        self: &Arc<Self>,
        name: &PathComponent,
        mode: u32,
        kind: NewChild,
        duplicate_is_bug: bool,
        ctx: &RequestContext,
    ) -> FsResult<InodePtr> {
        self.materialize_opt(None).await?;
        let mount = Arc::clone(self.core.mount());

        let (ptr, target_path) = {
            let mut contents = self.contents.write().await;

            // Re-check linkage under the lock: a concurrent rmdir/rename
            // may have detached us after the materialize above.
            let Some(my_path) = self.core.path() else {
                return Err(FsError::NotFound);
            };
            if self.core.number() == InodeNumber::ROOT && name.as_str() == RESERVED_NAME {
                return Err(FsError::AlreadyExists);
            }
            if contents.entries.contains_key(name) {
                if duplicate_is_bug {
                    return Err(fs_bug!(
                        "create() for existing entry {:?} in {}",
                        name,
                        self.core.log_path()
                    ));
                }
                return Err(FsError::AlreadyExists);
            }

            let number = mount.inode_map.allocate_inode_number()?;
            let ptr = match &kind {
                NewChild::File(initial) => {
                    mount.overlay.create_file(number, initial)?;
                    file::new_materialized(
                        Arc::clone(&mount),
                        number,
                        self.core.number(),
                        name.clone(),
                        mode,
                    )
                }
                NewChild::Dir => {
                    let dir = DirContents::empty_materialized();
                    mount.overlay.save_dir(number, &dir.to_overlay())?;
                    InodePtr::Tree(TreeInode::new(
                        Arc::clone(&mount),
                        number,
                        Some((self.core.number(), name.clone())),
                        dir,
                    ))
                }
            };
            mount.inode_map.inode_created(&ptr);

            let mut entry = DirEntry::materialized(mode, number);
            entry.loaded = Some(ptr.clone());
            contents.entries.insert(name.clone(), entry);
            contents.timestamps.touch_modified(SystemTime::now());
            mount
                .overlay
                .save_dir(self.core.number(), &contents.to_overlay())?;
            (ptr, my_path.join(name))
        };

        if !ctx.is_kernel_request() {
            mount.invalidate_entry(self.core.number(), name);
        }
        mount.journal.add_delta(JournalChange::Created(target_path));
        debug!(
            parent = %self.core.log_path(),
            name = name.as_str(),
            ino = ptr.number().get(),
            "created entry"
        );
        Ok(ptr)
    }

    // ---- unlink / rmdir -------------------------------------------------

    pub async fn unlink(
        self: &Arc<Self>,
        name: &PathComponent,
        ctx: &RequestContext,
    ) -> FsResult<()> {
        self.remove_child(name, RemoveKind::File, ctx).await
    }

    pub async fn rmdir(
        self: &Arc<Self>,
        name: &PathComponent,
        ctx: &RequestContext,
    ) -> FsResult<()> {
        self.remove_child(name, RemoveKind::Dir, ctx).await
    }

    /// Typed remove with a bounded retry loop: if the entry is replaced or
    /// unloaded between the child lookup and the removal, the removal
    /// returns the retry sentinel and the child is reloaded.
    async fn remove_child(
        self: &Arc<Self>,
        name: &PathComponent,
        kind: RemoveKind,
        ctx: &RequestContext,
    ) -> FsResult<()> {
        let mount = Arc::clone(self.core.mount());
        let mut attempt = 0;
        loop {
            attempt += 1;
            ctx.check_interrupt()?;

            // Verify type and removability before materializing ourself.
            let child = self.get_or_load_child(name, ctx).await?;
            match kind {
                RemoveKind::File => {
                    if child.is_tree() {
                        return Err(FsError::IsDir);
                    }
                }
                RemoveKind::Dir => {
                    let Some(tree) = child.as_tree() else {
                        return Err(FsError::NotDir);
                    };
                    if !tree.is_empty().await {
                        return Err(FsError::NotEmpty);
                    }
                }
            }

            let result = {
                let rename_lock = mount.rename_lock.lock().await;
                // Resolve the journal path under the rename lock so it is
                // accurate at the time of the removal.
                let Some(my_path) = self.core.path() else {
                    return Err(FsError::NotFound);
                };
                match self
                    .try_remove_child(
                        &rename_lock,
                        name,
                        None,
                        kind,
                        !ctx.is_kernel_request(),
                    )
                    .await
                {
                    Ok(()) => {
                        mount
                            .journal
                            .add_delta(JournalChange::Removed(my_path.join(name)));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(()) => return Ok(()),
                Err(FsError::Retry) if attempt <= MAX_REMOVE_RETRIES => continue,
                Err(FsError::Retry) => {
                    return Err(FsError::Io(std::io::Error::other(
                        "entry kept changing while the remove was in progress",
                    )))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove `name` under the already-held rename lock.
    ///
    /// When `expected` is given, the removal only proceeds if the entry
    /// still resolves to that exact inode. Returns [`FsError::Retry`] when
    /// the entry is not loaded (the caller reloads and retries).
    pub(crate) async fn try_remove_child(
        self: &Arc<Self>,
        rename_lock: &RenameLockGuard<'_>,
        name: &PathComponent,
        expected: Option<&InodePtr>,
        kind: RemoveKind,
        flush_kernel_cache: bool,
    ) -> FsResult<()> {
        self.materialize_opt(Some(rename_lock)).await?;

        // Entries directly under the reserved directory are not removable.
        if self.core.number() == InodeNumber::RESERVED {
            return Err(FsError::NotPermitted);
        }

        let mount = Arc::clone(self.core.mount());
        let deleted: InodePtr;
        {
            let mut contents = self.contents.write().await;
            let Some(entry) = contents.entries.get(name) else {
                return Err(FsError::NotFound);
            };
            let Some(loaded) = entry.loaded.clone() else {
                return Err(FsError::Retry);
            };
            if let Some(expected) = expected {
                if !expected.ptr_eq(&loaded) {
                    return Err(FsError::Retry);
                }
            }
            match kind {
                RemoveKind::File => {
                    if loaded.is_tree() {
                        return Err(FsError::IsDir);
                    }
                }
                RemoveKind::Dir => {
                    let Some(tree) = loaded.as_tree() else {
                        return Err(FsError::NotDir);
                    };
                    if !tree.is_empty().await {
                        return Err(FsError::NotEmpty);
                    }
                }
            }

            loaded.core().mark_unlinked();
            mount.inode_map.remember_unlinked(&loaded);
            contents.entries.remove(name);
            contents.timestamps.touch_modified(SystemTime::now());
            mount
                .overlay
                .save_dir(self.core.number(), &contents.to_overlay())?;
            deleted = loaded;
        }
        // Destroy our reference outside the contents lock; if it was the
        // last one, the inode's overlay data is cleaned up on drop.
        drop(deleted);

        if flush_kernel_cache {
            mount.invalidate_entry(self.core.number(), name);
        }
        debug!(
            parent = %self.core.log_path(),
            name = name.as_str(),
            "removed entry"
        );
        Ok(())
    }

    // ---- materialization ------------------------------------------------

    /// Promote this directory from "identical to source control" to
    /// "authoritatively stored in the overlay", propagating to the root.
    pub(crate) async fn materialize_opt(
        self: &Arc<Self>,
        rename_lock: Option<&RenameLockGuard<'_>>,
    ) -> FsResult<()> {
        // Optimistic fast path before touching the rename lock.
        if self.contents.read().await.is_materialized() {
            return Ok(());
        }
        let mount = Arc::clone(self.core.mount());
        match rename_lock {
            Some(lock) => self.materialize_locked(lock).await,
            None => {
                // Only one materialization state-change sequence runs at a
                // time; interleaving the overlay updates of a parent and
                // child could persist a parent that claims a child is
                // materialized before the child's own data exists.
                let guard = mount.rename_lock.lock().await;
                self.materialize_locked(&guard).await
            }
        }
    }

    async fn materialize_locked(
        self: &Arc<Self>,
        rename_lock: &RenameLockGuard<'_>,
    ) -> FsResult<()> {
        let mount = Arc::clone(self.core.mount());
        {
            let mut contents = self.contents.write().await;
            if contents.is_materialized() {
                return Ok(());
            }
            // Persist our own overlay data before telling the parent: on a
            // crash the benign state is "child has overlay data the parent
            // does not know about", never the inverse.
            contents.tree_hash = None;
            mount
                .overlay
                .save_dir(self.core.number(), &contents.to_overlay())?;
        }
        debug!(ino = self.core.number().get(), path = %self.core.log_path(), "materialized directory");
        propagate_materialized(&self.core, rename_lock).await
    }

    /// Record that the child `name` became materialized, materializing
    /// this directory too. Returns true when nothing changed (the upward
    /// walk stops there).
    pub(crate) async fn child_materialized_step(
        self: &Arc<Self>,
        name: &PathComponent,
        child_number: InodeNumber,
    ) -> FsResult<bool> {
        let mount = Arc::clone(self.core.mount());
        let mut contents = self.contents.write().await;
        let dir_materialized = contents.is_materialized();
        let Some(entry) = contents.entries.get_mut(name) else {
            return Err(fs_bug!(
                "childMaterialized for missing entry {:?} in {}",
                name,
                self.core.log_path()
            ));
        };
        if dir_materialized && entry.is_materialized() {
            return Ok(true);
        }
        entry.hash = None;
        entry.inode_number = Some(child_number);
        contents.tree_hash = None;
        mount
            .overlay
            .save_dir(self.core.number(), &contents.to_overlay())?;
        Ok(false)
    }

    /// Inverse of [`child_materialized_step`], used during checkout when a
    /// subtree collapses back to a source-control tree. The parent itself
    /// stays materialized here so it records the child's hash; a later
    /// post-checkout pass may dematerialize the parent in turn.
    pub(crate) async fn child_dematerialized(
        self: &Arc<Self>,
        rename_lock: &RenameLockGuard<'_>,
        name: &PathComponent,
        child_hash: Hash,
    ) -> FsResult<()> {
        let mount = Arc::clone(self.core.mount());
        {
            let mut contents = self.contents.write().await;
            let Some(entry) = contents.entries.get_mut(name) else {
                return Err(fs_bug!(
                    "childDematerialized for missing entry {:?} in {}",
                    name,
                    self.core.log_path()
                ));
            };
            if !entry.is_materialized() && entry.hash == Some(child_hash) {
                return Ok(());
            }
            entry.hash = Some(child_hash);
            contents.tree_hash = None;
            mount
                .overlay
                .save_dir(self.core.number(), &contents.to_overlay())?;
        }
        propagate_materialized(&self.core, rename_lock).await
    }

    /// Update the persisted mode of a child entry (chmod path).
    pub(crate) async fn update_entry_mode(
        self: &Arc<Self>,
        name: &PathComponent,
        mode: u32,
    ) -> FsResult<()> {
        let mount = Arc::clone(self.core.mount());
        let mut contents = self.contents.write().await;
        let Some(entry) = contents.entries.get_mut(name) else {
            return Ok(());
        };
        entry.mode = mode;
        if contents.is_materialized() {
            mount
                .overlay
                .save_dir(self.core.number(), &contents.to_overlay())?;
        }
        Ok(())
    }

    // ---- rename ---------------------------------------------------------

    /// Rename `name` in this directory to `dest_name` under `dest_parent`.
    ///
    /// Both endpoints must be loaded for the rename to proceed; when they
    /// are not, all locks are released, the loads run, and the whole
    /// operation restarts so every validation is redone against fresh
    /// state.
    pub async fn rename(
        self: &Arc<Self>,
        name: &PathComponent,
        dest_parent: &Arc<TreeInode>,
        dest_name: &PathComponent,
        ctx: &RequestContext,
    ) -> FsResult<()> {
        let mount = Arc::clone(self.core.mount());
        loop {
            ctx.check_interrupt()?;
            let needs = {
                let rename_lock = mount.rename_lock.lock().await;
                self.materialize_opt(Some(&rename_lock)).await?;
                if !Arc::ptr_eq(self, dest_parent) {
                    dest_parent.materialize_opt(Some(&rename_lock)).await?;
                }
                match self
                    .rename_locked(&rename_lock, name, dest_parent, dest_name)
                    .await?
                {
                    RenameOutcome::Done => return Ok(()),
                    RenameOutcome::NeedLoads { src, dest } => (src, dest),
                }
            };
            if needs.0 {
                self.get_or_load_child(name, ctx).await?;
            }
            if needs.1 {
                dest_parent.get_or_load_child(dest_name, ctx).await?;
            }
        }
    }

    /// Acquire the contents locks in the deadlock-free order, validate, and
    /// perform the rename if both endpoints are loaded.
    ///
    /// Lock order under the rename lock: ancestors before descendants;
    /// unrelated siblings destination-first. Cases:
    /// - source parent == destination parent: one lock;
    /// - source parent is an ancestor of the destination parent: source,
    ///   destination, destination child;
    /// - otherwise: destination, destination child, then source, unless
    ///   the source parent *is* the destination child, whose already-held
    ///   lock is reused.
    async fn rename_locked(
        self: &Arc<Self>,
        rename_lock: &RenameLockGuard<'_>,
        name: &PathComponent,
        dest_parent: &Arc<TreeInode>,
        dest_name: &PathComponent,
    ) -> FsResult<RenameOutcome> {
        let mount = Arc::clone(self.core.mount());
        let same_parent = Arc::ptr_eq(self, dest_parent);

        let mut src_guard: Option<OwnedRwLockWriteGuard<DirContents>> = None;
        let mut dest_guard: Option<OwnedRwLockWriteGuard<DirContents>> = None;
        let mut dest_child_guard: Option<OwnedRwLockWriteGuard<DirContents>> = None;
        let mut dest_child_is_src = false;

        let dest_child_of = |contents: &DirContents| -> Option<InodePtr> {
            contents
                .entries
                .get(dest_name)
                .and_then(|e| e.loaded.clone())
        };

        if same_parent {
            let guard = Arc::clone(&self.contents).write_owned().await;
            if let Some(InodePtr::Tree(child)) = dest_child_of(&guard) {
                dest_child_guard = Some(Arc::clone(&child.contents).write_owned().await);
            }
            src_guard = Some(guard);
        } else if is_ancestor(&mount, self.core.number(), dest_parent) {
            src_guard = Some(Arc::clone(&self.contents).write_owned().await);
            let guard = Arc::clone(&dest_parent.contents).write_owned().await;
            if let Some(InodePtr::Tree(child)) = dest_child_of(&guard) {
                dest_child_guard = Some(Arc::clone(&child.contents).write_owned().await);
            }
            dest_guard = Some(guard);
        } else {
            let guard = Arc::clone(&dest_parent.contents).write_owned().await;
            if let Some(InodePtr::Tree(child)) = dest_child_of(&guard) {
                let child_guard = Arc::clone(&child.contents).write_owned().await;
                if child.core.number() == self.core.number() {
                    // The destination child is the source parent; reuse its
                    // lock rather than deadlocking on a second acquire. The
                    // rename is doomed to fail validation below.
                    dest_child_is_src = true;
                }
                dest_child_guard = Some(child_guard);
            }
            dest_guard = Some(guard);
            if !dest_child_is_src {
                src_guard = Some(Arc::clone(&self.contents).write_owned().await);
            }
        }

        if dest_child_is_src {
            let src_contents = dest_child_guard
                .as_deref()
                .ok_or_else(|| fs_bug!("missing aliased source lock in rename"))?;
            return Err(match src_contents.entries.get(name) {
                None => FsError::NotFound,
                Some(e) if e.is_directory() => FsError::NotEmpty,
                Some(_) => FsError::IsDir,
            });
        }

        let mut src = src_guard.ok_or_else(|| fs_bug!("missing source lock in rename"))?;

        // --- validation, with all locks held ---
        let (src_is_dir, src_number, src_loaded) = {
            let Some(entry) = src.entries.get(name) else {
                return Err(FsError::NotFound);
            };
            (entry.is_directory(), entry.inode_number, entry.loaded.clone())
        };
        let dest_view: &DirContents = dest_guard.as_deref().unwrap_or(&*src);
        let dest_entry = dest_view.entries.get(dest_name);
        let dest_exists = dest_entry.is_some();
        let dest_is_dir = dest_entry.map(DirEntry::is_directory).unwrap_or(false);
        let dest_number = dest_entry.and_then(|e| e.inode_number);
        let dest_loaded = dest_entry.and_then(|e| e.loaded.clone());
        let same_inode =
            dest_exists && src_number.is_some() && src_number == dest_number;

        if src_is_dir {
            // A directory may only replace nothing, itself, or an empty
            // directory.
            if dest_exists && !same_inode {
                if !dest_is_dir {
                    trace!(
                        src = %self.core.log_path(),
                        name = name.as_str(),
                        "rename directory over file refused"
                    );
                    return Err(FsError::NotDir);
                }
                if let Some(child_contents) = dest_child_guard.as_deref() {
                    if !child_contents.entries.is_empty() {
                        return Err(FsError::NotEmpty);
                    }
                }
            }
        } else if dest_exists && dest_is_dir {
            return Err(FsError::IsDir);
        }

        if dest_parent.core.is_unlinked() {
            return Err(FsError::NotFound);
        }

        if same_inode {
            // Renaming an entry over itself is a no-op success.
            return Ok(RenameOutcome::Done);
        }

        let need_src = src_loaded.is_none();
        let need_dest = dest_exists && dest_loaded.is_none();
        if need_src || need_dest {
            return Ok(RenameOutcome::NeedLoads {
                src: need_src,
                dest: need_dest,
            });
        }

        let child_ptr = src_loaded.ok_or_else(|| fs_bug!("rename source lost its inode"))?;

        // A directory cannot move into its own subtree. The source being a
        // descendant of the destination is impossible here: the destination
        // child would be non-empty and already rejected.
        if src_is_dir {
            if let Some(src_tree) = child_ptr.as_tree() {
                if Arc::ptr_eq(&src_tree, dest_parent)
                    || is_ancestor(&mount, src_tree.core.number(), dest_parent)
                {
                    return Err(FsError::Invalid);
                }
            }
        }

        // --- perform ---
        let now = SystemTime::now();
        let mut deleted: Option<InodePtr> = None;
        let Some(moved_entry) = src.entries.remove(name) else {
            return Err(fs_bug!("rename source entry vanished under its lock"));
        };
        {
            let dest_map: &mut BTreeMap<PathComponent, DirEntry> = match dest_guard.as_deref_mut()
            {
                Some(dest) => &mut dest.entries,
                None => &mut src.entries,
            };
            if let Some(replaced) = dest_map.insert(dest_name.clone(), moved_entry) {
                if let Some(old_ptr) = replaced.loaded {
                    old_ptr.core().mark_unlinked();
                    mount.inode_map.remember_unlinked(&old_ptr);
                    deleted = Some(old_ptr);
                }
            }
        }
        child_ptr
            .core()
            .update_location(dest_parent.core.number(), dest_name.clone());

        src.timestamps.touch_modified(now);
        mount.overlay.save_dir(self.core.number(), &src.to_overlay())?;
        if let Some(dest) = dest_guard.as_deref_mut() {
            dest.timestamps.touch_modified(now);
            mount
                .overlay
                .save_dir(dest_parent.core.number(), &dest.to_overlay())?;
        }

        // Release the contents locks before journaling so the journal's
        // ordering reflects the post-rename state; the rename lock itself
        // stays held by our caller.
        drop(dest_child_guard);
        drop(dest_guard);
        drop(src);

        let src_path = self.core.path();
        let dest_path = dest_parent.core.path();
        if let (Some(src_path), Some(dest_path)) = (src_path, dest_path) {
            mount.journal.add_delta(JournalChange::Renamed {
                from: src_path.join(name),
                to: dest_path.join(dest_name),
            });
        }
        drop(deleted);
        debug!(
            src = %self.core.log_path(),
            name = name.as_str(),
            dest = %dest_parent.core.log_path(),
            dest_name = dest_name.as_str(),
            "renamed entry"
        );
        Ok(RenameOutcome::Done)
    }
}

enum NewChild {
    File(Vec<u8>),
    Dir,
}

enum RenameOutcome {
    Done,
    NeedLoads { src: bool, dest: bool },
}

/// Is `ancestor_number` an ancestor of `tree`? Callers hold the rename
/// lock, so the location chain cannot change underneath the walk.
///
/// The walk follows loaded inodes where possible and falls back to the
/// inode map's parent-chain records for ancestors that are not resident.
/// A link that cannot be resolved at all never rules ancestry *out*: the
/// check gates a cycle-creating rename, so "unknown" must read as
/// "possibly an ancestor".
fn is_ancestor(mount: &Arc<MountInner>, ancestor_number: InodeNumber, tree: &Arc<TreeInode>) -> bool {
    let mut current = tree
        .core
        .location_snapshot()
        .parent
        .map(|(number, _)| number);
    while let Some(number) = current {
        if number == ancestor_number {
            return true;
        }
        current = match mount.inode_map.get_loaded(number) {
            Some(ptr) => ptr
                .core()
                .location_snapshot()
                .parent
                .map(|(parent_number, _)| parent_number),
            None => match mount.inode_map.record_for(number) {
                Some(record) => Some(record.parent),
                None => return true,
            },
        };
    }
    false
}

/// Walk the parent chain, marking each ancestor materialized until one
/// already was. Iterative so that no contents lock is ever held while
/// acquiring an ancestor's.
pub(crate) async fn propagate_materialized(
    start: &InodeCore,
    _rename_lock: &RenameLockGuard<'_>,
) -> FsResult<()> {
    let mut child_number = start.number();
    let mut next = loaded_parent_of(start)?;
    while let Some((parent, name)) = next {
        let unchanged = parent.child_materialized_step(&name, child_number).await?;
        if unchanged {
            break;
        }
        child_number = parent.core().number();
        next = loaded_parent_of(parent.core())?;
    }
    Ok(())
}

impl Drop for TreeInode {
    fn drop(&mut self) {
        if !self.core.is_unlinked() {
            return;
        }
        let Ok(contents) = self.contents.try_read() else {
            warn!(
                ino = self.core.number().get(),
                "directory contents locked during drop; skipping overlay cleanup"
            );
            return;
        };
        if contents.is_materialized() {
            if let Err(e) = self.core.mount().overlay.remove_dir(self.core.number()) {
                warn!(
                    ino = self.core.number().get(),
                    error = %e,
                    "failed to remove overlay data for unlinked directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::TreeEntryKind;

    fn hash(n: u8) -> Hash {
        Hash::from_bytes([n; Hash::LEN])
    }

    fn name(s: &str) -> PathComponent {
        s.parse().unwrap()
    }

    #[test]
    fn dir_contents_from_tree_is_unmaterialized() {
        let tree = Tree::new(
            hash(1),
            vec![
                TreeEntry::new(name("b"), TreeEntryKind::Tree, hash(2)),
                TreeEntry::new(name("a"), TreeEntryKind::Regular, hash(3)),
            ],
        );
        let contents = DirContents::from_tree(&tree);
        assert_eq!(contents.tree_hash, Some(hash(1)));
        assert!(!contents.is_materialized());
        let names: Vec<_> = contents.entries.keys().map(|k| k.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(contents.entries[&name("b")].is_directory());
        assert!(!contents.entries[&name("a")].is_directory());
    }

    #[test]
    fn overlay_round_trip_preserves_entries() {
        let mut contents = DirContents::empty_materialized();
        contents.entries.insert(
            name("x"),
            DirEntry::materialized(libc::S_IFREG as u32 | 0o644, InodeNumber(9)),
        );
        contents.entries.insert(
            name("y"),
            DirEntry {
                mode: libc::S_IFDIR as u32 | 0o755,
                inode_number: None,
                hash: Some(hash(5)),
                loaded: None,
            },
        );
        let restored = DirContents::from_overlay(contents.to_overlay());
        assert!(restored.is_materialized());
        assert_eq!(restored.entries.len(), 2);
        let x = &restored.entries[&name("x")];
        assert_eq!(x.inode_number, Some(InodeNumber(9)));
        assert!(x.is_materialized());
        let y = &restored.entries[&name("y")];
        assert_eq!(y.hash, Some(hash(5)));
        assert!(!y.is_materialized());
    }
}
