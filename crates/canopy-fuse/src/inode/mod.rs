//! The in-memory inode graph.
//!
//! Inodes come in two variants, [`FileInode`] and [`TreeInode`], sharing an
//! [`InodeCore`]: the stable inode number, the back edge to the parent
//! directory, and the kernel (FUSE) reference count. The back edge is the
//! parent's inode *number* plus this inode's name, resolved through the
//! inode map on demand: an observer handle, never a shared owner, so the
//! parent/child reference cycle has exactly one owning direction (parent
//! entry table → child).

pub mod file;
pub mod map;
pub mod tree;

use crate::fs_bug;
use crate::mount::MountInner;
use canopy_core::{InodeNumber, PathComponent, RelativePath, Timestamps};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub use file::FileInode;
pub use tree::TreeInode;

/// Where an inode currently sits in the tree.
#[derive(Debug, Clone)]
pub struct InodeLocation {
    /// Parent inode number and this inode's name there. `None` for the root.
    pub parent: Option<(InodeNumber, PathComponent)>,
    /// Set once the inode is removed from its parent's entry table. The
    /// name is retained so diagnostics can refer to the former path.
    pub unlinked: bool,
}

/// State shared by both inode variants.
pub struct InodeCore {
    number: InodeNumber,
    mount: Arc<MountInner>,
    location: parking_lot::RwLock<InodeLocation>,
    /// Count of outstanding kernel lookup references, decremented by forget.
    fuse_refcount: AtomicU64,
}

impl InodeCore {
    pub(crate) fn new(
        mount: Arc<MountInner>,
        number: InodeNumber,
        parent: Option<(InodeNumber, PathComponent)>,
    ) -> Self {
        InodeCore {
            number,
            mount,
            location: parking_lot::RwLock::new(InodeLocation {
                parent,
                unlinked: false,
            }),
            fuse_refcount: AtomicU64::new(0),
        }
    }

    pub fn number(&self) -> InodeNumber {
        self.number
    }

    pub(crate) fn mount(&self) -> &Arc<MountInner> {
        &self.mount
    }

    pub fn fuse_refcount(&self) -> u64 {
        self.fuse_refcount.load(Ordering::Acquire)
    }

    pub fn inc_fuse_refcount(&self) -> u64 {
        self.fuse_refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn add_fuse_refcount(&self, count: u64) {
        self.fuse_refcount.fetch_add(count, Ordering::AcqRel);
    }

    /// Decrement by `count`, saturating at zero. Returns the new value.
    pub(crate) fn dec_fuse_refcount(&self, count: u64) -> u64 {
        let mut current = self.fuse_refcount.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(count);
            match self.fuse_refcount.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn location_snapshot(&self) -> InodeLocation {
        self.location.read().clone()
    }

    pub fn is_unlinked(&self) -> bool {
        self.location.read().unlinked
    }

    /// Detach from the parent. Callers must hold the mount rename lock and
    /// the parent's contents write lock.
    pub(crate) fn mark_unlinked(&self) {
        self.location.write().unlinked = true;
    }

    /// Move to a new parent/name after a rename. Callers must hold the
    /// mount rename lock.
    pub(crate) fn update_location(&self, parent: InodeNumber, name: PathComponent) {
        let mut loc = self.location.write();
        loc.parent = Some((parent, name));
    }

    /// The mount-relative path of this inode, or `None` if it (or any
    /// ancestor) has been unlinked.
    pub fn path(&self) -> Option<RelativePath> {
        let mut names: Vec<PathComponent> = Vec::new();
        let mut loc = self.location_snapshot();
        if loc.unlinked {
            return None;
        }
        while let Some((parent_number, name)) = loc.parent {
            names.push(name);
            let parent = self.mount.inode_map.get_loaded(parent_number)?;
            loc = parent.core().location_snapshot();
            if loc.unlinked {
                return None;
            }
        }
        let mut path = RelativePath::root();
        for name in names.iter().rev() {
            path = path.join(name);
        }
        Some(path)
    }

    /// Path for log lines: the real path, or a marker for unlinked inodes.
    pub fn log_path(&self) -> String {
        match self.path() {
            Some(p) if p.is_root() => "/".to_string(),
            Some(p) => p.as_str().to_string(),
            None => format!("<unlinked:{}>", self.number),
        }
    }
}

/// A strong reference to a loaded inode of either variant.
#[derive(Clone)]
pub enum InodePtr {
    File(Arc<FileInode>),
    Tree(Arc<TreeInode>),
}

impl std::fmt::Debug for InodePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InodePtr::File(inode) => f.debug_tuple("File").field(&inode.core().number()).finish(),
            InodePtr::Tree(inode) => f.debug_tuple("Tree").field(&inode.core().number()).finish(),
        }
    }
}

impl InodePtr {
    pub fn core(&self) -> &InodeCore {
        match self {
            InodePtr::File(f) => f.core(),
            InodePtr::Tree(t) => t.core(),
        }
    }

    pub fn number(&self) -> InodeNumber {
        self.core().number()
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, InodePtr::Tree(_))
    }

    pub fn as_tree(&self) -> Option<Arc<TreeInode>> {
        match self {
            InodePtr::Tree(t) => Some(Arc::clone(t)),
            InodePtr::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<Arc<FileInode>> {
        match self {
            InodePtr::File(f) => Some(Arc::clone(f)),
            InodePtr::Tree(_) => None,
        }
    }

    pub(crate) fn downgrade(&self) -> InodeWeak {
        match self {
            InodePtr::File(f) => InodeWeak::File(Arc::downgrade(f)),
            InodePtr::Tree(t) => InodeWeak::Tree(Arc::downgrade(t)),
        }
    }

    /// Number of strong references to the underlying inode object.
    pub(crate) fn strong_count(&self) -> usize {
        match self {
            InodePtr::File(f) => Arc::strong_count(f),
            InodePtr::Tree(t) => Arc::strong_count(t),
        }
    }

    /// Identity comparison: do both pointers name the same inode object?
    pub fn ptr_eq(&self, other: &InodePtr) -> bool {
        match (self, other) {
            (InodePtr::File(a), InodePtr::File(b)) => Arc::ptr_eq(a, b),
            (InodePtr::Tree(a), InodePtr::Tree(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A non-owning reference used by the inode map's loaded table.
pub(crate) enum InodeWeak {
    File(Weak<FileInode>),
    Tree(Weak<TreeInode>),
}

impl InodeWeak {
    pub(crate) fn upgrade(&self) -> Option<InodePtr> {
        match self {
            InodeWeak::File(f) => f.upgrade().map(InodePtr::File),
            InodeWeak::Tree(t) => t.upgrade().map(InodePtr::Tree),
        }
    }
}

/// Kernel-visible attributes of one inode.
#[derive(Debug, Clone, Copy)]
pub struct InodeAttr {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub timestamps: Timestamps,
}

/// Resolve the loaded parent tree of `core`, for upward propagation paths
/// that hold the rename lock (the parent of a loaded, linked inode is
/// always loaded itself).
pub(crate) fn loaded_parent_of(core: &InodeCore) -> crate::error::FsResult<Option<(Arc<TreeInode>, PathComponent)>> {
    let loc = core.location_snapshot();
    if loc.unlinked {
        return Ok(None);
    }
    let Some((parent_number, name)) = loc.parent else {
        return Ok(None);
    };
    let parent = core
        .mount()
        .inode_map
        .get_loaded(parent_number)
        .and_then(|p| p.as_tree())
        .ok_or_else(|| {
            fs_bug!(
                "parent {} of loaded inode {} is not loaded",
                parent_number,
                core.number()
            )
        })?;
    Ok(Some((parent, name)))
}
