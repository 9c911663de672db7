//! The directory diff engine: compare the live tree against a
//! source-control tree, honoring gitignore rules accumulated from the root.
//!
//! Each directory merge-walks its sorted entries against the sorted tree
//! entries. Entries that need an inode (loaded children, materialized
//! children, subtree recursions) are deferred, run concurrently, and
//! joined; a failure in one deferred entry is reported through the
//! callback and does not abort the surrounding diff.

use crate::error::{FsError, FsResult};
use crate::inode::tree::TreeInode;
use crate::inode::InodePtr;
use crate::mount::Mount;
use crate::request::RequestContext;
use canopy_core::{
    Hash, IgnoreFile, IgnoreStack, ObjectStore, PathComponent, RelativePath, Tree, TreeEntry,
};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Per-path results of a diff.
pub trait DiffCallback: Send + Sync {
    fn untracked_file(&self, path: &RelativePath);
    fn ignored_file(&self, path: &RelativePath);
    fn modified_file(&self, path: &RelativePath);
    fn removed_file(&self, path: &RelativePath);
    fn diff_error(&self, path: &RelativePath, error: &FsError);
}

/// Collects every callback into vectors; the common observer for tests
/// and the management surface.
#[derive(Default)]
pub struct DiffCollector {
    inner: parking_lot::Mutex<DiffResults>,
}

#[derive(Default, Debug, Clone)]
pub struct DiffResults {
    pub untracked: Vec<RelativePath>,
    pub ignored: Vec<RelativePath>,
    pub modified: Vec<RelativePath>,
    pub removed: Vec<RelativePath>,
    pub errors: Vec<(RelativePath, String)>,
}

impl DiffCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> DiffResults {
        let mut results = self.inner.lock().clone();
        results.untracked.sort();
        results.ignored.sort();
        results.modified.sort();
        results.removed.sort();
        results
    }
}

impl DiffCallback for DiffCollector {
    fn untracked_file(&self, path: &RelativePath) {
        self.inner.lock().untracked.push(path.clone());
    }
    fn ignored_file(&self, path: &RelativePath) {
        self.inner.lock().ignored.push(path.clone());
    }
    fn modified_file(&self, path: &RelativePath) {
        self.inner.lock().modified.push(path.clone());
    }
    fn removed_file(&self, path: &RelativePath) {
        self.inner.lock().removed.push(path.clone());
    }
    fn diff_error(&self, path: &RelativePath, error: &FsError) {
        self.inner
            .lock()
            .errors
            .push((path.clone(), error.to_string()));
    }
}

pub(crate) struct DiffContext<'a> {
    pub callback: &'a dyn DiffCallback,
    pub list_ignored: bool,
    pub store: Arc<dyn ObjectStore>,
    pub request: RequestContext,
}

const IGNORE_FILENAME: &str = ".gitignore";

impl Mount {
    /// Diff the live tree against `tree` (or report everything as
    /// untracked/removed when absent).
    pub async fn diff(
        self: &Arc<Self>,
        tree: Option<Hash>,
        callback: &dyn DiffCallback,
        list_ignored: bool,
    ) -> FsResult<()> {
        let tree = match tree {
            Some(hash) => Some(self.inner().store.get_tree(hash).await?),
            None => None,
        };
        let ctx = DiffContext {
            callback,
            list_ignored,
            store: Arc::clone(&self.inner().store),
            request: RequestContext::internal(),
        };
        self.root()
            .diff(
                &ctx,
                RelativePath::root(),
                tree,
                IgnoreStack::empty(),
                false,
            )
            .await
    }
}

enum DeferredDiff {
    /// A local directory with no counterpart in the tree: everything in it
    /// is untracked.
    UntrackedDir {
        parent: Arc<TreeInode>,
        name: PathComponent,
        path: RelativePath,
        ignored: bool,
    },
    /// A tree-side subtree with no local counterpart: everything in it is
    /// removed.
    RemovedTree { path: RelativePath, hash: Hash },
    /// Present on both sides and potentially different; needs the inode.
    Modified {
        parent: Arc<TreeInode>,
        name: PathComponent,
        path: RelativePath,
        scm_entry: TreeEntry,
        ignored: bool,
    },
}

impl DeferredDiff {
    fn path(&self) -> &RelativePath {
        match self {
            DeferredDiff::UntrackedDir { path, .. } => path,
            DeferredDiff::RemovedTree { path, .. } => path,
            DeferredDiff::Modified { path, .. } => path,
        }
    }

    async fn run(
        self,
        ctx: &DiffContext<'_>,
        ignore: Arc<IgnoreStack>,
        is_ignored: bool,
    ) -> FsResult<()> {
        match self {
            DeferredDiff::UntrackedDir {
                parent,
                name,
                path,
                ignored,
            } => {
                let child = parent.get_or_load_child_tree(&name, &ctx.request).await?;
                child.diff(ctx, path, None, ignore, ignored).await
            }
            DeferredDiff::RemovedTree { path, hash } => {
                walk_removed_tree(ctx, path, hash).await
            }
            DeferredDiff::Modified {
                parent,
                name,
                path,
                scm_entry,
                ignored,
            } => {
                let child = parent.get_or_load_child(&name, &ctx.request).await?;
                diff_modified_entry(ctx, child, path, scm_entry, ignore, ignored || is_ignored)
                    .await
            }
        }
    }
}

/// Report every file contained in the tree at `hash` as removed.
fn walk_removed_tree<'a, 'c: 'a>(
    ctx: &'a DiffContext<'c>,
    path: RelativePath,
    hash: Hash,
) -> BoxFuture<'a, FsResult<()>> {
    async move {
        let tree = ctx.store.get_tree(hash).await?;
        let mut subtrees = Vec::new();
        for entry in tree.entries() {
            let entry_path = path.join(&entry.name);
            if entry.is_tree() {
                subtrees.push(walk_removed_tree(ctx, entry_path, entry.hash));
            } else {
                ctx.callback.removed_file(&entry_path);
            }
        }
        for result in join_all(subtrees).await {
            result?;
        }
        Ok(())
    }
    .boxed()
}

/// Diff one loaded inode against its source-control counterpart, handling
/// the four type combinations.
async fn diff_modified_entry(
    ctx: &DiffContext<'_>,
    child: InodePtr,
    path: RelativePath,
    scm_entry: TreeEntry,
    ignore: Arc<IgnoreStack>,
    is_ignored: bool,
) -> FsResult<()> {
    match (child, scm_entry.is_tree()) {
        (InodePtr::Tree(tree), true) => {
            let scm_tree = ctx.store.get_tree(scm_entry.hash).await?;
            tree.diff(ctx, path, Some(scm_tree), ignore, is_ignored).await
        }
        (InodePtr::Tree(tree), false) => {
            // A file in source control became a local directory: the file
            // is gone and the directory contents are untracked.
            ctx.callback.removed_file(&path);
            tree.diff(ctx, path, None, ignore, is_ignored).await
        }
        (InodePtr::File(_), true) => {
            // A directory in source control became a local file.
            if !is_ignored {
                ctx.callback.untracked_file(&path);
            } else if ctx.list_ignored {
                ctx.callback.ignored_file(&path);
            }
            walk_removed_tree(ctx, path, scm_entry.hash).await
        }
        (InodePtr::File(file), false) => {
            let mode = file.mode().await;
            if mode != scm_entry.kind.initial_mode() {
                trace!(path = %path, "file modified: mode change");
                ctx.callback.modified_file(&path);
                return Ok(());
            }
            match file.content_hash().await {
                // Identical hashes imply identical contents.
                Some(hash) if hash == scm_entry.hash => {}
                Some(_) => ctx.callback.modified_file(&path),
                None => {
                    // Materialized: compare bytes against the blob.
                    let blob = ctx.store.get_blob(scm_entry.hash).await?;
                    let local = file.read_all().await?;
                    if local != blob.data() {
                        ctx.callback.modified_file(&path);
                    }
                }
            }
            Ok(())
        }
    }
}

impl TreeInode {
    pub(crate) fn diff<'a, 'c: 'a>(
        self: &Arc<Self>,
        ctx: &'a DiffContext<'c>,
        current_path: RelativePath,
        tree: Option<Arc<Tree>>,
        parent_ignore: Arc<IgnoreStack>,
        is_ignored: bool,
    ) -> BoxFuture<'a, FsResult<()>> {
        let this = Arc::clone(self);
        async move {
            {
                let contents = this.contents.read().await;
                if let (Some(tree_hash), Some(tree)) = (contents.tree_hash, tree.as_ref()) {
                    if tree_hash == tree.hash() {
                        // Unmodified subtree; nothing can differ below.
                        return Ok(());
                    }
                }
            }
            debug!(path = %current_path, "diffing directory");

            // Inside an ignored directory every entry is ignored; the
            // directory's own ignore file cannot unhide anything.
            let ignore = if is_ignored {
                parent_ignore
            } else {
                let file = this.load_ignore_file(ctx).await;
                parent_ignore.push(current_path.clone(), file)
            };

            // Snapshot the entry metadata the walk needs, so the contents
            // lock is not held while deferred entries run.
            let inode_entries: Vec<EntrySnapshot> = {
                let contents = this.contents.read().await;
                contents
                    .entries
                    .iter()
                    .map(|(name, entry)| EntrySnapshot {
                        name: name.clone(),
                        is_directory: entry.is_directory(),
                        needs_inode: entry.loaded.is_some() || entry.is_materialized(),
                        mode: entry.mode,
                        hash: entry.hash,
                    })
                    .collect()
            };

            let empty: &[TreeEntry] = &[];
            let scm_entries = tree.as_deref().map(Tree::entries).unwrap_or(empty);
            let mut deferred: Vec<DeferredDiff> = Vec::new();

            // Merge-walk the two lists; both are sorted by name.
            let mut scm_idx = 0;
            let mut inode_idx = 0;
            loop {
                match (scm_entries.get(scm_idx), inode_entries.get(inode_idx)) {
                    (None, None) => break,
                    (Some(scm), None) => {
                        process_removed(ctx, &current_path, scm, &mut deferred);
                        scm_idx += 1;
                    }
                    (Some(scm), Some(entry)) if scm.name < entry.name => {
                        process_removed(ctx, &current_path, scm, &mut deferred);
                        scm_idx += 1;
                    }
                    (Some(scm), Some(entry)) if scm.name == entry.name => {
                        process_both_present(
                            ctx,
                            &this,
                            &current_path,
                            scm,
                            entry,
                            &ignore,
                            is_ignored,
                            &mut deferred,
                        );
                        scm_idx += 1;
                        inode_idx += 1;
                    }
                    (_, Some(entry)) => {
                        process_untracked(
                            ctx,
                            &this,
                            &current_path,
                            entry,
                            &ignore,
                            is_ignored,
                            &mut deferred,
                        );
                        inode_idx += 1;
                    }
                }
            }

            // Run the deferred entries concurrently; report failures via
            // the callback but never fail the parent diff over them.
            let paths: Vec<RelativePath> =
                deferred.iter().map(|d| d.path().clone()).collect();
            let results = join_all(
                deferred
                    .into_iter()
                    .map(|d| d.run(ctx, Arc::clone(&ignore), is_ignored)),
            )
            .await;
            for (path, result) in paths.iter().zip(results) {
                if let Err(error) = result {
                    warn!(path = %path, error = %error, "diff entry failed");
                    ctx.callback.diff_error(path, &error);
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Load and parse this directory's ignore file. Any failure degrades
    /// to "no rules" with a log line.
    async fn load_ignore_file(self: &Arc<Self>, ctx: &DiffContext<'_>) -> IgnoreFile {
        let name = match PathComponent::new(IGNORE_FILENAME) {
            Ok(name) => name,
            Err(_) => return IgnoreFile::default(),
        };
        let is_dir = {
            let contents = self.contents.read().await;
            match contents.entries.get(&name) {
                None => return IgnoreFile::default(),
                Some(entry) => entry.is_directory(),
            }
        };
        if is_dir {
            warn!(dir = %self.core().log_path(), "ignoring .gitignore directory");
            return IgnoreFile::default();
        }
        let file = match self.get_or_load_child(&name, &ctx.request).await {
            Ok(ptr) => match ptr.as_file() {
                Some(file) => file,
                None => return IgnoreFile::default(),
            },
            Err(e) => {
                warn!(dir = %self.core().log_path(), error = %e, "failed to load ignore file");
                return IgnoreFile::default();
            }
        };

        // Resolve a symlinked ignore file one hop, relative to this
        // directory; anything else degrades to no rules.
        let mode = file.mode().await;
        let target = if mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32 {
            let link = match file.readlink().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(dir = %self.core().log_path(), error = %e, "failed to read ignore symlink");
                    return IgnoreFile::default();
                }
            };
            let Ok(link) = String::from_utf8(link) else {
                return IgnoreFile::default();
            };
            let Ok(rel) = RelativePath::parse(&link) else {
                warn!(dir = %self.core().log_path(), target = %link, "unsupported ignore symlink target");
                return IgnoreFile::default();
            };
            match self.get_child_recursive(&rel, &ctx.request).await {
                Ok(ptr) => match ptr.as_file() {
                    Some(file) => file,
                    None => return IgnoreFile::default(),
                },
                Err(e) => {
                    warn!(dir = %self.core().log_path(), error = %e, "failed to resolve ignore symlink");
                    return IgnoreFile::default();
                }
            }
        } else {
            file
        };

        match target.read_all().await {
            Ok(bytes) => IgnoreFile::parse(&bytes),
            Err(e) => {
                warn!(dir = %self.core().log_path(), error = %e, "failed to read ignore file");
                IgnoreFile::default()
            }
        }
    }
}

/// What the merge walk needs to know about one local entry.
struct EntrySnapshot {
    name: PathComponent,
    is_directory: bool,
    /// Loaded or materialized: only the inode itself can answer.
    needs_inode: bool,
    mode: u32,
    hash: Option<Hash>,
}

fn process_untracked(
    ctx: &DiffContext<'_>,
    parent: &Arc<TreeInode>,
    current_path: &RelativePath,
    entry: &EntrySnapshot,
    ignore: &Arc<IgnoreStack>,
    parent_ignored: bool,
    deferred: &mut Vec<DeferredDiff>,
) {
    let path = current_path.join(&entry.name);
    let entry_ignored = parent_ignored || ignore.is_ignored(&path, entry.is_directory);

    if entry.is_directory {
        if !entry_ignored || ctx.list_ignored {
            deferred.push(DeferredDiff::UntrackedDir {
                parent: Arc::clone(parent),
                name: entry.name.clone(),
                path,
                ignored: entry_ignored,
            });
        }
    } else if !entry_ignored {
        trace!(path = %path, "untracked file");
        ctx.callback.untracked_file(&path);
    } else if ctx.list_ignored {
        ctx.callback.ignored_file(&path);
    }
}

fn process_removed(
    ctx: &DiffContext<'_>,
    current_path: &RelativePath,
    scm_entry: &TreeEntry,
    deferred: &mut Vec<DeferredDiff>,
) {
    let path = current_path.join(&scm_entry.name);
    if scm_entry.is_tree() {
        deferred.push(DeferredDiff::RemovedTree {
            path,
            hash: scm_entry.hash,
        });
    } else {
        trace!(path = %path, "removed file");
        ctx.callback.removed_file(&path);
    }
}

fn process_both_present(
    ctx: &DiffContext<'_>,
    parent: &Arc<TreeInode>,
    current_path: &RelativePath,
    scm_entry: &TreeEntry,
    entry: &EntrySnapshot,
    ignore: &Arc<IgnoreStack>,
    parent_ignored: bool,
    deferred: &mut Vec<DeferredDiff>,
) {
    let path = current_path.join(&entry.name);
    // Ignore status only matters for directories here: a file that is both
    // on disk and in source control is tracked regardless.
    let entry_ignored = if parent_ignored {
        true
    } else if entry.is_directory || scm_entry.is_tree() {
        ignore.is_ignored(&path, true)
    } else {
        false
    };

    if entry.needs_inode {
        // Loaded or materialized: the inode decides.
        deferred.push(DeferredDiff::Modified {
            parent: Arc::clone(parent),
            name: entry.name.clone(),
            path,
            scm_entry: scm_entry.clone(),
            ignored: entry_ignored,
        });
        return;
    }

    // Unloaded, unmaterialized entry: the hashes decide.
    if entry.mode == scm_entry.kind.initial_mode() && entry.hash == Some(scm_entry.hash) {
        return;
    }
    if entry.is_directory {
        // A changed subtree; load it and recurse to find the differences.
        deferred.push(DeferredDiff::Modified {
            parent: Arc::clone(parent),
            name: entry.name.clone(),
            path,
            scm_entry: scm_entry.clone(),
            ignored: entry_ignored,
        });
        return;
    }
    if scm_entry.is_tree() {
        // A tree became a non-directory entry locally.
        if !entry_ignored {
            ctx.callback.untracked_file(&path);
        } else if ctx.list_ignored {
            ctx.callback.ignored_file(&path);
        }
        deferred.push(DeferredDiff::RemovedTree {
            path: current_path.join(&entry.name),
            hash: scm_entry.hash,
        });
        return;
    }
    trace!(path = %path, "modified file");
    ctx.callback.modified_file(&path);
}
