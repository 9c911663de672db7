//! File inodes: regular files, symlinks, and unix-domain sockets.
//!
//! A file is in one of two states: identical to a source-control blob
//! (`hash` present, bytes fetched lazily from the object store) or
//! materialized (`hash` absent, authoritative bytes in the overlay keyed by
//! inode number). The first write promotes the file to materialized and
//! propagates materialization up the parent chain under the rename lock.

use crate::error::{FsError, FsResult};
use crate::fs_bug;
use crate::inode::tree::propagate_materialized;
use crate::inode::{loaded_parent_of, InodeAttr, InodeCore, InodePtr};
use crate::mount::MountInner;
use canopy_core::{Hash, InodeNumber, PathComponent, Timestamps};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub(crate) struct FileState {
    pub mode: u32,
    /// Source-control blob this file matches; `None` once materialized.
    pub hash: Option<Hash>,
    pub timestamps: Timestamps,
}

pub struct FileInode {
    core: InodeCore,
    state: Mutex<FileState>,
}

impl std::fmt::Debug for FileInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FileInode").field(&self.core.number()).finish()
    }
}

impl FileInode {
    pub(crate) fn new(
        mount: Arc<MountInner>,
        number: InodeNumber,
        parent: InodeNumber,
        name: PathComponent,
        mode: u32,
        hash: Option<Hash>,
    ) -> Arc<Self> {
        Arc::new(FileInode {
            core: InodeCore::new(mount, number, Some((parent, name))),
            state: Mutex::new(FileState {
                mode,
                hash,
                timestamps: Timestamps::now(),
            }),
        })
    }

    pub fn core(&self) -> &InodeCore {
        &self.core
    }

    pub async fn is_materialized(&self) -> bool {
        self.state.lock().await.hash.is_none()
    }

    pub async fn mode(&self) -> u32 {
        self.state.lock().await.mode
    }

    pub async fn getattr(&self) -> FsResult<InodeAttr> {
        let state = self.state.lock().await;
        let mount = self.core.mount();
        let size = match state.hash {
            Some(hash) => mount.store.get_blob(hash).await?.len(),
            None => mount.overlay.file_len(self.core.number())?,
        };
        Ok(InodeAttr {
            ino: self.core.number().get(),
            size,
            mode: state.mode,
            nlink: 1,
            timestamps: state.timestamps,
        })
    }

    pub async fn read_all(&self) -> FsResult<Vec<u8>> {
        let state = self.state.lock().await;
        let mount = self.core.mount();
        match state.hash {
            Some(hash) => Ok(mount.store.get_blob(hash).await?.data().to_vec()),
            None => Ok(mount.overlay.read_file(self.core.number())?),
        }
    }

    pub async fn read(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let bytes = self.read_all().await?;
        let start = (offset as usize).min(bytes.len());
        let end = (start + size as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    /// The symlink target. Fails with `EINVAL` on non-symlinks.
    pub async fn readlink(&self) -> FsResult<Vec<u8>> {
        {
            let state = self.state.lock().await;
            if state.mode & libc::S_IFMT as u32 != libc::S_IFLNK as u32 {
                return Err(FsError::Invalid);
            }
        }
        self.read_all().await
    }

    /// Write `data` at `offset`, zero-filling any gap. Materializes first.
    pub async fn write(self: &Arc<Self>, offset: u64, data: &[u8]) -> FsResult<u32> {
        self.materialize(None).await?;
        let mut state = self.state.lock().await;
        let mount = self.core.mount();
        let ino = self.core.number();

        let mut bytes = mount.overlay.read_file(ino)?;
        let end = offset as usize + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(data);
        mount.overlay.write_file(ino, &bytes)?;
        state.timestamps.touch_modified(SystemTime::now());
        debug!(ino = ino.get(), offset, len = data.len(), "file write");
        Ok(data.len() as u32)
    }

    /// Resize the file. A truncation to zero skips the blob fetch.
    pub async fn truncate(self: &Arc<Self>, size: u64) -> FsResult<()> {
        if size == 0 {
            self.materialize_empty().await?;
        } else {
            self.materialize(None).await?;
        }
        let mut state = self.state.lock().await;
        let mount = self.core.mount();
        let ino = self.core.number();
        let mut bytes = mount.overlay.read_file(ino)?;
        bytes.resize(size as usize, 0);
        mount.overlay.write_file(ino, &bytes)?;
        state.timestamps.touch_modified(SystemTime::now());
        Ok(())
    }

    /// chmod. Changing permissions is a local modification, so it
    /// materializes; the parent's persisted entry mode is updated too.
    pub async fn set_mode(self: &Arc<Self>, permissions: u32) -> FsResult<()> {
        self.materialize(None).await?;
        let new_mode = {
            let mut state = self.state.lock().await;
            let file_type = state.mode & libc::S_IFMT as u32;
            state.mode = file_type | (permissions & 0o7777);
            state.timestamps.ctime = SystemTime::now();
            state.mode
        };
        if let Some((parent, name)) = loaded_parent_of(&self.core)? {
            parent.update_entry_mode(&name, new_mode).await?;
        }
        Ok(())
    }

    /// Promote to materialized: copy the blob's bytes into the overlay,
    /// then mark the parent chain materialized. The overlay is written
    /// before any parent is updated, so a crash can leave unreferenced
    /// overlay data but never a parent that lies about it.
    pub(crate) async fn materialize(self: &Arc<Self>, contents: Option<&[u8]>) -> FsResult<()> {
        {
            let state = self.state.lock().await;
            if state.hash.is_none() {
                return Ok(());
            }
        }
        let mount = Arc::clone(self.core.mount());
        let rename_lock = mount.rename_lock.lock().await;
        {
            let mut state = self.state.lock().await;
            let Some(hash) = state.hash else {
                return Ok(());
            };
            let bytes = match contents {
                Some(bytes) => bytes.to_vec(),
                None => mount.store.get_blob(hash).await?.data().to_vec(),
            };
            mount.overlay.create_file(self.core.number(), &bytes)?;
            state.hash = None;
        }
        propagate_materialized(&self.core, &rename_lock).await
    }

    async fn materialize_empty(self: &Arc<Self>) -> FsResult<()> {
        self.materialize(Some(b"")).await
    }

    /// The blob hash this file still matches, if unmodified.
    pub async fn content_hash(&self) -> Option<Hash> {
        self.state.lock().await.hash
    }
}

impl Drop for FileInode {
    fn drop(&mut self) {
        // Destroying an unlinked materialized file removes its overlay
        // bytes; linked files keep theirs for the next load.
        if !self.core.is_unlinked() {
            return;
        }
        let Ok(state) = self.state.try_lock() else {
            warn!(
                ino = self.core.number().get(),
                "file state locked during drop; skipping overlay cleanup"
            );
            return;
        };
        if state.hash.is_none() {
            if let Err(e) = self.core.mount().overlay.remove_file(self.core.number()) {
                warn!(
                    ino = self.core.number().get(),
                    error = %e,
                    "failed to remove overlay data for unlinked file"
                );
            }
        }
    }
}

/// Build a file inode for a freshly created entry whose overlay bytes have
/// already been written. Used by create/symlink/mknod.
pub(crate) fn new_materialized(
    mount: Arc<MountInner>,
    number: InodeNumber,
    parent: InodeNumber,
    name: PathComponent,
    mode: u32,
) -> InodePtr {
    InodePtr::File(FileInode::new(mount, number, parent, name, mode, None))
}

/// Sanity-check an inode pointer into a file, reporting a bug otherwise.
/// Used where a non-directory entry must have produced a file inode.
pub(crate) fn expect_file(ptr: InodePtr) -> FsResult<Arc<FileInode>> {
    let number = ptr.number();
    ptr.as_file()
        .ok_or_else(|| fs_bug!("inode {} expected to be a file", number))
}
