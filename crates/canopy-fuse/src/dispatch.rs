//! The dispatch adapter: typed kernel-filesystem operations over the
//! inode graph.
//!
//! Every operation takes a [`RequestContext`] and returns a typed reply or
//! an [`FsError`]; the `fuser` glue in [`crate::filesystem`] translates
//! both into wire replies. Keeping this layer free of `fuser` types makes
//! the whole protocol surface exercisable from plain async tests.

use crate::error::{FsError, FsResult};
use crate::inode::tree::DirListEntry;
use crate::inode::{InodeAttr, InodePtr};
use crate::mount::Mount;
use crate::request::RequestContext;
use canopy_core::{InodeNumber, PathComponent, Timestamps};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::trace;

/// Reply to lookup-like operations, mirroring a kernel `fuse_entry_out`.
///
/// A negative (not-found) lookup is encoded as inode zero with maximum
/// validity, letting the kernel cache the miss instead of repeating it.
#[derive(Debug, Clone, Copy)]
pub struct EntryReply {
    pub ino: u64,
    pub generation: u64,
    pub attr: InodeAttr,
    pub attr_ttl: Duration,
    pub entry_ttl: Duration,
}

impl EntryReply {
    fn negative() -> Self {
        EntryReply {
            ino: 0,
            generation: 0,
            attr: InodeAttr {
                ino: 0,
                size: 0,
                mode: 0,
                nlink: 0,
                timestamps: Timestamps::all(SystemTime::UNIX_EPOCH),
            },
            attr_ttl: Duration::MAX,
            entry_ttl: Duration::MAX,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.ino == 0
    }
}

/// One readdir row. Names here include `.` and `..`, so they are plain
/// strings rather than validated path components.
#[derive(Debug, Clone)]
pub struct ReaddirEntry {
    pub ino: u64,
    pub name: String,
    pub mode: u32,
}

/// Static statfs numbers; the projected tree has no meaningful block
/// accounting of its own.
#[derive(Debug, Clone, Copy)]
pub struct StatfsReply {
    pub block_size: u32,
    pub name_max: u32,
}

pub struct Dispatcher {
    mount: Arc<Mount>,
    dir_handles: DashMap<u64, Arc<Vec<ReaddirEntry>>>,
    file_handles: DashMap<u64, InodeNumber>,
    next_handle: AtomicU64,
}

impl Dispatcher {
    pub fn new(mount: Arc<Mount>) -> Self {
        Dispatcher {
            mount,
            dir_handles: DashMap::new(),
            file_handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    fn fresh_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    async fn attr_of(&self, ptr: &InodePtr) -> FsResult<InodeAttr> {
        match ptr {
            InodePtr::File(file) => file.getattr().await,
            InodePtr::Tree(tree) => Ok(tree.getattr().await),
        }
    }

    async fn entry_reply(&self, ptr: InodePtr) -> FsResult<EntryReply> {
        let attr = self.attr_of(&ptr).await?;
        // The kernel now holds a reference; forget() releases it.
        ptr.core().inc_fuse_refcount();
        let config = self.mount.config();
        Ok(EntryReply {
            ino: ptr.number().get(),
            generation: 1,
            attr,
            attr_ttl: config.attr_ttl,
            entry_ttl: config.entry_ttl,
        })
    }

    // ---- operations ------------------------------------------------------

    pub async fn lookup(
        &self,
        ctx: &RequestContext,
        parent: u64,
        name: &str,
    ) -> FsResult<EntryReply> {
        trace!(parent, name, "lookup");
        let name = parse_name(name)?;
        let tree = self.mount.lookup_tree_inode(InodeNumber(parent)).await?;
        match tree.get_or_load_child(&name, ctx).await {
            Ok(ptr) => self.entry_reply(ptr).await,
            // Let the kernel cache the miss.
            Err(FsError::NotFound) => Ok(EntryReply::negative()),
            Err(e) => Err(e),
        }
    }

    pub async fn forget(&self, ino: u64, nlookup: u64) {
        trace!(ino, nlookup, "forget");
        self.mount.forget(InodeNumber(ino), nlookup).await;
    }

    pub async fn getattr(&self, _ctx: &RequestContext, ino: u64) -> FsResult<InodeAttr> {
        trace!(ino, "getattr");
        let ptr = self.mount.lookup_inode(InodeNumber(ino)).await?;
        self.attr_of(&ptr).await
    }

    pub async fn setattr(
        &self,
        _ctx: &RequestContext,
        ino: u64,
        mode: Option<u32>,
        size: Option<u64>,
    ) -> FsResult<InodeAttr> {
        trace!(ino, ?mode, ?size, "setattr");
        let ptr = self.mount.lookup_inode(InodeNumber(ino)).await?;
        match &ptr {
            InodePtr::File(file) => {
                if let Some(size) = size {
                    file.truncate(size).await?;
                }
                if let Some(mode) = mode {
                    file.set_mode(mode).await?;
                }
            }
            InodePtr::Tree(_) => {
                if size.is_some() {
                    return Err(FsError::IsDir);
                }
                // Directory chmod is accepted and ignored: directory modes
                // are fixed in the projection.
            }
        }
        self.attr_of(&ptr).await
    }

    pub async fn readlink(&self, _ctx: &RequestContext, ino: u64) -> FsResult<Vec<u8>> {
        trace!(ino, "readlink");
        let file = self.mount.lookup_file_inode(InodeNumber(ino)).await?;
        file.readlink().await
    }

    pub async fn mkdir(
        &self,
        ctx: &RequestContext,
        parent: u64,
        name: &str,
        mode: u32,
    ) -> FsResult<EntryReply> {
        trace!(parent, name, mode, "mkdir");
        let name = parse_name(name)?;
        let tree = self.mount.lookup_tree_inode(InodeNumber(parent)).await?;
        let child = tree.mkdir(&name, mode, ctx).await?;
        self.entry_reply(InodePtr::Tree(child)).await
    }

    pub async fn mknod(
        &self,
        ctx: &RequestContext,
        parent: u64,
        name: &str,
        mode: u32,
    ) -> FsResult<EntryReply> {
        trace!(parent, name, mode, "mknod");
        let name = parse_name(name)?;
        let tree = self.mount.lookup_tree_inode(InodeNumber(parent)).await?;
        let child = tree.mknod(&name, mode, ctx).await?;
        self.entry_reply(InodePtr::File(child)).await
    }

    pub async fn symlink(
        &self,
        ctx: &RequestContext,
        parent: u64,
        name: &str,
        target: &[u8],
    ) -> FsResult<EntryReply> {
        trace!(parent, name, "symlink");
        let name = parse_name(name)?;
        let tree = self.mount.lookup_tree_inode(InodeNumber(parent)).await?;
        let child = tree.symlink(&name, target, ctx).await?;
        self.entry_reply(InodePtr::File(child)).await
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        parent: u64,
        name: &str,
        mode: u32,
    ) -> FsResult<(EntryReply, u64)> {
        trace!(parent, name, mode, "create");
        let name = parse_name(name)?;
        let tree = self.mount.lookup_tree_inode(InodeNumber(parent)).await?;
        let child = tree.create(&name, mode, ctx).await?;
        let number = child.core().number();
        let reply = self.entry_reply(InodePtr::File(child)).await?;
        let fh = self.fresh_handle();
        self.file_handles.insert(fh, number);
        Ok((reply, fh))
    }

    pub async fn unlink(&self, ctx: &RequestContext, parent: u64, name: &str) -> FsResult<()> {
        trace!(parent, name, "unlink");
        let name = parse_name(name)?;
        let tree = self.mount.lookup_tree_inode(InodeNumber(parent)).await?;
        tree.unlink(&name, ctx).await
    }

    pub async fn rmdir(&self, ctx: &RequestContext, parent: u64, name: &str) -> FsResult<()> {
        trace!(parent, name, "rmdir");
        let name = parse_name(name)?;
        let tree = self.mount.lookup_tree_inode(InodeNumber(parent)).await?;
        tree.rmdir(&name, ctx).await
    }

    pub async fn rename(
        &self,
        ctx: &RequestContext,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> FsResult<()> {
        trace!(parent, name, new_parent, new_name, "rename");
        let name = parse_name(name)?;
        let new_name = parse_name(new_name)?;
        let src = self.mount.lookup_tree_inode(InodeNumber(parent)).await?;
        let dest = self.mount.lookup_tree_inode(InodeNumber(new_parent)).await?;
        src.rename(&name, &dest, &new_name, ctx).await
    }

    /// Hard links cannot be represented in source control; always refused.
    pub async fn link(&self, _ctx: &RequestContext, ino: u64, new_name: &str) -> FsResult<EntryReply> {
        trace!(ino, new_name, "link refused");
        Err(FsError::NotPermitted)
    }

    pub async fn open(&self, _ctx: &RequestContext, ino: u64) -> FsResult<u64> {
        trace!(ino, "open");
        let file = self.mount.lookup_file_inode(InodeNumber(ino)).await?;
        let fh = self.fresh_handle();
        self.file_handles.insert(fh, file.core().number());
        Ok(fh)
    }

    pub async fn release(&self, fh: u64) {
        trace!(fh, "release");
        self.file_handles.remove(&fh);
    }

    pub async fn read(
        &self,
        _ctx: &RequestContext,
        ino: u64,
        offset: u64,
        size: u32,
    ) -> FsResult<Vec<u8>> {
        trace!(ino, offset, size, "read");
        let file = self.mount.lookup_file_inode(InodeNumber(ino)).await?;
        file.read(offset, size).await
    }

    pub async fn write(
        &self,
        _ctx: &RequestContext,
        ino: u64,
        offset: u64,
        data: &[u8],
    ) -> FsResult<u32> {
        trace!(ino, offset, len = data.len(), "write");
        let file = self.mount.lookup_file_inode(InodeNumber(ino)).await?;
        file.write(offset, data).await
    }

    pub async fn opendir(&self, _ctx: &RequestContext, ino: u64) -> FsResult<u64> {
        trace!(ino, "opendir");
        let tree = self.mount.lookup_tree_inode(InodeNumber(ino)).await?;
        let parent_ino = tree
            .core()
            .location_snapshot()
            .parent
            .map(|(parent, _)| parent.get())
            .unwrap_or(ino);

        let mut listing = vec![
            ReaddirEntry {
                ino,
                name: ".".to_string(),
                mode: libc::S_IFDIR as u32 | 0o755,
            },
            ReaddirEntry {
                ino: parent_ino,
                name: "..".to_string(),
                mode: libc::S_IFDIR as u32 | 0o755,
            },
        ];
        for DirListEntry { name, ino, mode } in tree.readdir().await {
            listing.push(ReaddirEntry {
                ino,
                name: name.as_str().to_string(),
                mode,
            });
        }
        let fh = self.fresh_handle();
        self.dir_handles.insert(fh, Arc::new(listing));
        Ok(fh)
    }

    /// Rows of the snapshot taken at opendir, starting at `offset`.
    pub async fn readdir(
        &self,
        _ctx: &RequestContext,
        fh: u64,
        offset: u64,
    ) -> FsResult<Vec<ReaddirEntry>> {
        trace!(fh, offset, "readdir");
        let listing = self
            .dir_handles
            .get(&fh)
            .map(|entry| Arc::clone(&entry))
            .ok_or(FsError::Retry)?;
        Ok(listing
            .iter()
            .skip(offset as usize)
            .cloned()
            .collect())
    }

    pub async fn releasedir(&self, fh: u64) {
        trace!(fh, "releasedir");
        self.dir_handles.remove(&fh);
    }

    pub fn statfs(&self) -> StatfsReply {
        StatfsReply {
            block_size: 4096,
            name_max: 255,
        }
    }

    pub async fn getxattr(&self, _ctx: &RequestContext, ino: u64, name: &str) -> FsResult<Vec<u8>> {
        trace!(ino, name, "getxattr");
        // No extended attributes are projected.
        Err(FsError::NoXattr)
    }

    pub async fn listxattr(&self, _ctx: &RequestContext, ino: u64) -> FsResult<Vec<u8>> {
        trace!(ino, "listxattr");
        Ok(Vec::new())
    }

    pub async fn access(&self, _ctx: &RequestContext, ino: u64) -> FsResult<()> {
        trace!(ino, "access");
        // Permission enforcement is left to the kernel's mode checks.
        self.mount.lookup_inode(InodeNumber(ino)).await.map(|_| ())
    }
}

fn parse_name(name: &str) -> FsResult<PathComponent> {
    PathComponent::new(name).map_err(|_| FsError::Invalid)
}
