//! The checkout engine: atomically switch the mount's logical contents
//! from one source-control tree to another.
//!
//! Checkout holds the mount-wide rename lock for the entire operation, so
//! no rename, remove, or materialization transition can interleave. Per
//! directory it merge-walks the old and new trees, classifies each changed
//! name into an action or a conflict, applies the actions concurrently
//! (recursing into subtrees), and finally attempts to collapse the
//! directory back to an unmodified projection of the new tree.

use crate::error::{FsError, FsResult};
use crate::fs_bug;
use crate::inode::tree::{DirContents, DirEntry, RemoveKind, TreeInode};
use crate::inode::{loaded_parent_of, InodePtr};
use crate::mount::{Mount, RenameLockGuard};
use crate::request::RequestContext;
use canopy_core::{Hash, PathComponent, RelativePath, Tree, TreeEntry};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Apply changes, stopping at conflicting entries.
    Normal,
    /// Report conflicts without mutating anything.
    DryRun,
    /// Apply changes over conflicts.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// Removed in the new tree, already missing locally.
    MissingRemoved,
    /// Removed locally, modified in the new tree.
    RemovedModified,
    /// Untracked local entry where the new tree adds one.
    UntrackedAdded,
    /// Modified locally and modified in the new tree.
    ModifiedModified,
    /// A directory slated for removal still has untracked children.
    DirectoryNotEmpty,
}

#[derive(Debug, Clone)]
pub struct CheckoutConflict {
    pub path: RelativePath,
    pub conflict_type: ConflictType,
}

/// The outcome of a checkout: conflicts detected, and errors collected
/// from individual actions (partial results are kept).
#[derive(Debug, Default)]
pub struct CheckoutResult {
    pub conflicts: Vec<CheckoutConflict>,
    pub errors: Vec<(RelativePath, FsError)>,
}

pub(crate) struct CheckoutContext<'a> {
    mode: CheckoutMode,
    rename_lock: RenameLockGuard<'a>,
    pub(crate) request: RequestContext,
    conflicts: parking_lot::Mutex<Vec<CheckoutConflict>>,
    errors: parking_lot::Mutex<Vec<(RelativePath, FsError)>>,
}

impl<'a> CheckoutContext<'a> {
    pub(crate) fn new(mode: CheckoutMode, rename_lock: RenameLockGuard<'a>) -> Self {
        CheckoutContext {
            mode,
            rename_lock,
            request: RequestContext::internal(),
            conflicts: parking_lot::Mutex::new(Vec::new()),
            errors: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_dry_run(&self) -> bool {
        self.mode == CheckoutMode::DryRun
    }

    pub(crate) fn force_update(&self) -> bool {
        self.mode == CheckoutMode::Force
    }

    pub(crate) fn rename_lock(&self) -> &RenameLockGuard<'a> {
        &self.rename_lock
    }

    pub(crate) fn add_conflict(&self, parent: &TreeInode, name: &PathComponent, ty: ConflictType) {
        let path = conflict_path(parent, Some(name));
        debug!(path = %path, conflict = ?ty, "checkout conflict");
        self.conflicts.lock().push(CheckoutConflict {
            path,
            conflict_type: ty,
        });
    }

    pub(crate) fn add_conflict_at(&self, path: RelativePath, ty: ConflictType) {
        debug!(path = %path, conflict = ?ty, "checkout conflict");
        self.conflicts.lock().push(CheckoutConflict {
            path,
            conflict_type: ty,
        });
    }

    pub(crate) fn add_error(&self, parent: &TreeInode, name: &PathComponent, error: FsError) {
        let path = conflict_path(parent, Some(name));
        warn!(path = %path, error = %error, "checkout action failed");
        self.errors.lock().push((path, error));
    }

    pub(crate) fn into_result(self) -> CheckoutResult {
        CheckoutResult {
            conflicts: self.conflicts.into_inner(),
            errors: self.errors.into_inner(),
        }
    }
}

fn conflict_path(inode: &TreeInode, name: Option<&PathComponent>) -> RelativePath {
    let base = inode.core().path().unwrap_or_default();
    match name {
        Some(name) => base.join(name),
        None => base,
    }
}

/// One name whose processing needs an inode: either already loaded, or
/// loaded on demand when the action runs.
struct CheckoutAction {
    name: PathComponent,
    old_entry: Option<TreeEntry>,
    new_entry: Option<TreeEntry>,
    inode: Option<InodePtr>,
}

impl CheckoutAction {
    async fn run(self, parent: Arc<TreeInode>, ctx: &CheckoutContext<'_>) -> FsResult<()> {
        let mount = Arc::clone(parent.core().mount());
        let inode = match self.inode {
            Some(ptr) => ptr,
            None => parent.get_or_load_child(&self.name, &ctx.request).await?,
        };

        // Conflict detection for loaded inodes. A tree-over-tree pair has
        // no immediate conflict here; the recursion below reports each
        // conflicting file inside individually.
        let conflict = match (&self.old_entry, &inode) {
            (None, _) => Some(ConflictType::UntrackedAdded),
            (Some(old), InodePtr::File(file)) => {
                if old.is_tree() || file_modified_from(file, old, &mount).await? {
                    Some(ConflictType::ModifiedModified)
                } else {
                    None
                }
            }
            (Some(old), InodePtr::Tree(_)) => {
                if old.is_tree() {
                    None
                } else {
                    Some(ConflictType::ModifiedModified)
                }
            }
        };
        if let Some(conflict) = conflict {
            ctx.add_conflict(&parent, &self.name, conflict);
            if !ctx.force_update() {
                return Ok(());
            }
        }

        let old_tree = match &self.old_entry {
            Some(e) if e.is_tree() => Some(mount.store.get_tree(e.hash).await?),
            _ => None,
        };
        let new_tree = match &self.new_entry {
            Some(e) if e.is_tree() => Some(mount.store.get_tree(e.hash).await?),
            _ => None,
        };
        parent
            .checkout_update_entry(ctx, &self.name, inode, old_tree, new_tree, self.new_entry)
            .await
    }
}

/// Is this loaded file different from the state `old` describes?
async fn file_modified_from(
    file: &Arc<crate::inode::FileInode>,
    old: &TreeEntry,
    mount: &Arc<crate::mount::MountInner>,
) -> FsResult<bool> {
    if file.mode().await != old.kind.initial_mode() {
        return Ok(true);
    }
    match file.content_hash().await {
        Some(hash) => Ok(hash != old.hash),
        None => {
            // Materialized: only a byte comparison can tell.
            let blob = mount.store.get_blob(old.hash).await?;
            let local = file.read_all().await?;
            Ok(local != blob.data())
        }
    }
}

impl Mount {
    /// Switch the mount from `from` to `to`.
    ///
    /// `from` is the tree the caller believes is currently checked out; it
    /// drives conflict detection. Conflicts and per-entry errors are
    /// collected and returned alongside whatever progress was made.
    pub async fn checkout(
        self: &Arc<Self>,
        from: Option<Hash>,
        to: Option<Hash>,
        mode: CheckoutMode,
    ) -> FsResult<CheckoutResult> {
        let inner = self.inner();
        let from_tree = match from {
            Some(hash) => Some(inner.store.get_tree(hash).await?),
            None => None,
        };
        let to_tree = match to {
            Some(hash) => Some(inner.store.get_tree(hash).await?),
            None => None,
        };
        debug!(
            from = %from.map(|h| h.to_hex()).unwrap_or_else(|| "<none>".into()),
            to = %to.map(|h| h.to_hex()).unwrap_or_else(|| "<none>".into()),
            mode = ?mode,
            "checkout starting"
        );

        let rename_lock = inner.rename_lock.lock().await;
        let ctx = CheckoutContext::new(mode, rename_lock);
        self.root().checkout(&ctx, from_tree, to_tree).await?;
        let result = ctx.into_result();
        debug!(
            conflicts = result.conflicts.len(),
            errors = result.errors.len(),
            "checkout finished"
        );
        Ok(result)
    }
}

impl TreeInode {
    pub(crate) fn checkout<'a, 'g: 'a>(
        self: &Arc<Self>,
        ctx: &'a CheckoutContext<'g>,
        from_tree: Option<Arc<Tree>>,
        to_tree: Option<Arc<Tree>>,
    ) -> BoxFuture<'a, FsResult<()>> {
        let this = Arc::clone(self);
        async move {
            let actions = {
                let mut contents = this.contents.write().await;
                this.compute_checkout_actions(
                    ctx,
                    &mut contents,
                    from_tree.as_deref(),
                    to_tree.as_deref(),
                )
            };

            let names: Vec<PathComponent> =
                actions.iter().map(|a| a.name.clone()).collect();
            let results = join_all(
                actions
                    .into_iter()
                    .map(|action| action.run(Arc::clone(&this), ctx)),
            )
            .await;
            for (name, result) in names.into_iter().zip(results) {
                if let Err(error) = result {
                    ctx.add_error(&this, &name, error);
                }
            }

            this.save_overlay_post_checkout(ctx, to_tree.as_deref()).await
        }
        .boxed()
    }

    /// Whether the whole subtree can be skipped because this directory
    /// already matches the relevant trees.
    fn can_short_circuit_checkout(
        &self,
        ctx: &CheckoutContext<'_>,
        tree_hash: Hash,
        from_tree: Option<&Tree>,
        to_tree: Option<&Tree>,
    ) -> bool {
        if ctx.is_dry_run() {
            // A dry run only looks for conflicts against the `from` state.
            return match from_tree {
                Some(from) => tree_hash == from.hash(),
                None => to_tree.is_none_or(|to| tree_hash == to.hash()),
            };
        }
        if to_tree.is_none_or(|to| tree_hash != to.hash()) {
            return false;
        }
        match from_tree {
            // Already in the destination state and no old state to
            // conflict against.
            None => true,
            // Keep walking when we differ from the old state so conflicts
            // are still reported, even though the contents already match.
            Some(from) => tree_hash == from.hash(),
        }
    }

    fn compute_checkout_actions(
        self: &Arc<Self>,
        ctx: &CheckoutContext<'_>,
        contents: &mut DirContents,
        from_tree: Option<&Tree>,
        to_tree: Option<&Tree>,
    ) -> Vec<CheckoutAction> {
        if let Some(tree_hash) = contents.tree_hash {
            if self.can_short_circuit_checkout(ctx, tree_hash, from_tree, to_tree) {
                return Vec::new();
            }
        }

        // Merge-walk the two sorted entry lists. Local entries that appear
        // in neither tree are untracked in both states and ignored here.
        let empty: &[TreeEntry] = &[];
        let old_entries = from_tree.map(Tree::entries).unwrap_or(empty);
        let new_entries = to_tree.map(Tree::entries).unwrap_or(empty);
        let mut actions = Vec::new();
        let mut old_idx = 0;
        let mut new_idx = 0;
        loop {
            let (old_entry, new_entry) = match (
                old_entries.get(old_idx),
                new_entries.get(new_idx),
            ) {
                (None, None) => break,
                (Some(old), None) => {
                    old_idx += 1;
                    (Some(old), None)
                }
                (None, Some(new)) => {
                    new_idx += 1;
                    (None, Some(new))
                }
                (Some(old), Some(new)) => {
                    if old.name < new.name {
                        old_idx += 1;
                        (Some(old), None)
                    } else if old.name > new.name {
                        new_idx += 1;
                        (None, Some(new))
                    } else {
                        old_idx += 1;
                        new_idx += 1;
                        (Some(old), Some(new))
                    }
                }
            };
            if let Some(action) =
                self.process_checkout_entry(ctx, contents, old_entry, new_entry)
            {
                actions.push(action);
            }
        }
        actions
    }

    /// Classify one changed name into an action, a conflict, or an
    /// immediate in-place update.
    fn process_checkout_entry(
        self: &Arc<Self>,
        ctx: &CheckoutContext<'_>,
        contents: &mut DirContents,
        old_entry: Option<&TreeEntry>,
        new_entry: Option<&TreeEntry>,
    ) -> Option<CheckoutAction> {
        // Entries identical between the old and new trees need no work,
        // unless a force update must revert local modifications over them.
        if !ctx.force_update() {
            if let (Some(old), Some(new)) = (old_entry, new_entry) {
                if old.kind == new.kind && old.hash == new.hash {
                    return None;
                }
            }
        }

        let name = match (old_entry, new_entry) {
            (Some(old), _) => &old.name,
            (None, Some(new)) => &new.name,
            (None, None) => return None,
        };

        if !contents.entries.contains_key(name) {
            match (old_entry, new_entry) {
                (None, Some(new)) => {
                    // Added in the new tree, absent locally: plain add.
                    if !ctx.is_dry_run() {
                        contents
                            .entries
                            .insert(new.name.clone(), DirEntry::from_tree_entry(new));
                        self.core()
                            .mount()
                            .invalidate_entry(self.core().number(), &new.name);
                    }
                }
                (Some(old), None) => {
                    // Removed in the new tree and already gone locally.
                    ctx.add_conflict(self, &old.name, ConflictType::MissingRemoved);
                }
                (Some(old), Some(new)) => {
                    // Removed locally but modified in the new tree.
                    ctx.add_conflict(self, &old.name, ConflictType::RemovedModified);
                    if ctx.force_update() {
                        contents
                            .entries
                            .insert(new.name.clone(), DirEntry::from_tree_entry(new));
                        self.core()
                            .mount()
                            .invalidate_entry(self.core().number(), &new.name);
                    }
                }
                (None, None) => {}
            }
            return None;
        }
        let entry = contents.entries.get_mut(name)?;

        if let Some(ptr) = entry.loaded.clone() {
            return Some(CheckoutAction {
                name: name.clone(),
                old_entry: old_entry.cloned(),
                new_entry: new_entry.cloned(),
                inode: Some(ptr),
            });
        }

        // An assigned inode number means the inode may be loading or
        // materialized; the action loads it to find out. (A materialized
        // entry always has a number.)
        if entry.inode_number.is_some() {
            return Some(CheckoutAction {
                name: name.clone(),
                old_entry: old_entry.cloned(),
                new_entry: new_entry.cloned(),
                inode: None,
            });
        }

        // Unloaded, unnumbered: the entry projects some source-control
        // object directly.
        let conflict = match old_entry {
            None => Some(ConflictType::UntrackedAdded),
            Some(old) if entry.hash != Some(old.hash) => Some(ConflictType::ModifiedModified),
            Some(_) => None,
        };
        if let Some(conflict) = conflict {
            if entry.is_directory() {
                // Load and recurse so every conflicting file inside is
                // reported individually.
                return Some(CheckoutAction {
                    name: name.clone(),
                    old_entry: old_entry.cloned(),
                    new_entry: new_entry.cloned(),
                    inode: None,
                });
            }
            ctx.add_conflict(self, name, conflict);
            if !ctx.force_update() {
                return None;
            }
        }

        if ctx.is_dry_run() {
            return None;
        }

        match new_entry {
            None => {
                contents.entries.remove(name);
            }
            Some(new) => {
                *entry = DirEntry::from_tree_entry(new);
            }
        }
        // No kernel invalidation here: entries without an inode number
        // were never handed to the kernel.
        None
    }

    /// Apply the new source-control state to one loaded child.
    pub(crate) async fn checkout_update_entry(
        self: &Arc<Self>,
        ctx: &CheckoutContext<'_>,
        name: &PathComponent,
        inode: InodePtr,
        old_tree: Option<Arc<Tree>>,
        new_tree: Option<Arc<Tree>>,
        new_entry: Option<TreeEntry>,
    ) -> FsResult<()> {
        let mount = Arc::clone(self.core().mount());
        let Some(tree_inode) = inode.as_tree() else {
            // A non-directory child: replace or remove it in place.
            if ctx.is_dry_run() {
                return Ok(());
            }
            let deleted: InodePtr;
            {
                let mut contents = self.contents.write().await;
                let Some(entry) = contents.entries.get_mut(name) else {
                    return Err(fs_bug!(
                        "entry {:?} removed from {} while the checkout held the rename lock",
                        name,
                        self.core().log_path()
                    ));
                };
                match &entry.loaded {
                    Some(ptr) if ptr.ptr_eq(&inode) => {}
                    _ => {
                        return Err(fs_bug!(
                            "entry {:?} in {} changed while the checkout held the rename lock",
                            name,
                            self.core().log_path()
                        ))
                    }
                }
                inode.core().mark_unlinked();
                mount.inode_map.remember_unlinked(&inode);
                match &new_entry {
                    Some(new) => *entry = DirEntry::from_tree_entry(new),
                    None => {
                        contents.entries.remove(name);
                    }
                }
                deleted = inode;
                // Our own overlay listing is persisted once, in
                // save_overlay_post_checkout, after all children settle.
            }
            drop(deleted);
            mount.invalidate_entry(self.core().number(), name);
            return Ok(());
        };

        // Directory to directory: recurse.
        if let Some(new_tree) = new_tree {
            return tree_inode.checkout(ctx, old_tree, Some(new_tree)).await;
        }

        if ctx.is_dry_run() {
            return Ok(());
        }

        // The directory is being removed (possibly replaced by a file).
        // Checking out against an empty destination removes everything
        // tracked inside and then the directory itself if it is empty.
        tree_inode.checkout(ctx, old_tree, None).await?;
        if !tree_inode.core().is_unlinked() {
            ctx.add_conflict_at(
                conflict_path(&tree_inode, None),
                ConflictType::DirectoryNotEmpty,
            );
            return Ok(());
        }

        let Some(new_entry) = new_entry else {
            return Ok(());
        };
        let inserted = {
            let mut contents = self.contents.write().await;
            match contents.entries.get(name) {
                Some(_) => false,
                None => {
                    contents
                        .entries
                        .insert(name.clone(), DirEntry::from_tree_entry(&new_entry));
                    true
                }
            }
        };
        if inserted {
            mount.invalidate_entry(self.core().number(), name);
        } else {
            // Nothing blocks new creations during a checkout, so another
            // writer may have claimed the slot first.
            ctx.add_error(self, name, FsError::AlreadyExists);
        }
        Ok(())
    }

    /// Try to dematerialize after all children have been processed, and
    /// persist or drop the overlay listing accordingly.
    async fn save_overlay_post_checkout(
        self: &Arc<Self>,
        ctx: &CheckoutContext<'_>,
        tree: Option<&Tree>,
    ) -> FsResult<()> {
        if ctx.is_dry_run() {
            return Ok(());
        }
        let mount = Arc::clone(self.core().mount());

        let (is_materialized, state_changed, delete_self) = {
            let mut contents = self.contents.write().await;
            let new_hash = try_dematerialize(&contents, tree);
            // An empty directory with no tree to match can be removed from
            // its parent entirely.
            let delete_self = tree.is_none() && contents.entries.is_empty();
            let old_hash = contents.tree_hash;
            contents.tree_hash = new_hash;
            let is_materialized = contents.is_materialized();
            let state_changed = old_hash != new_hash;
            if is_materialized {
                mount
                    .overlay
                    .save_dir(self.core().number(), &contents.to_overlay())?;
            }
            (is_materialized, state_changed, delete_self)
        };

        if delete_self && self.checkout_try_remove_empty_dir(ctx).await {
            return Ok(());
        }

        if state_changed {
            if let Some((parent, name)) = loaded_parent_of(self.core())? {
                if is_materialized {
                    crate::inode::tree::propagate_materialized(self.core(), ctx.rename_lock())
                        .await?;
                } else {
                    let tree_hash = tree
                        .map(Tree::hash)
                        .ok_or_else(|| fs_bug!("dematerialized with no tree"))?;
                    parent
                        .child_dematerialized(ctx.rename_lock(), &name, tree_hash)
                        .await?;
                }
            }
            // Overlay data is removed only after the parent knows we
            // dematerialized, mirroring the materialization ordering.
            if !is_materialized {
                mount.overlay.remove_dir(self.core().number())?;
            }
        }
        Ok(())
    }

    /// Remove this now-empty directory from its parent. Returns false if
    /// someone re-populated it concurrently or it is the root.
    async fn checkout_try_remove_empty_dir(
        self: &Arc<Self>,
        ctx: &CheckoutContext<'_>,
    ) -> bool {
        let Ok(Some((parent, name))) = loaded_parent_of(self.core()) else {
            return false;
        };
        let expected = InodePtr::Tree(Arc::clone(self));
        parent
            .try_remove_child(
                ctx.rename_lock(),
                &name,
                Some(&expected),
                RemoveKind::Dir,
                true,
            )
            .await
            .is_ok()
    }
}

/// If the live entries exactly match `tree` (same names, same hashes, no
/// materialized child), the directory can collapse back to that tree.
fn try_dematerialize(contents: &DirContents, tree: Option<&Tree>) -> Option<Hash> {
    let tree = tree?;
    let scm_entries = tree.entries();
    if scm_entries.len() != contents.entries.len() {
        return None;
    }
    for ((name, entry), scm_entry) in contents.entries.iter().zip(scm_entries) {
        if *name != scm_entry.name {
            return None;
        }
        // A materialized child forces us to stay materialized to record
        // that fact, even if its bytes happen to match.
        if entry.is_materialized() {
            return None;
        }
        if entry.hash != Some(scm_entry.hash) {
            return None;
        }
    }
    Some(tree.hash())
}
