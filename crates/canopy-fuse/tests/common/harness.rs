//! In-process test mount.
//!
//! Builds a [`Mount`] over a [`MemoryObjectStore`] and a tempdir-backed
//! overlay (no kernel mount involved), plus helpers for assembling store
//! fixtures and driving common operations by path.

// Not all tests use every helper.
#![allow(dead_code)]

use canopy_core::{
    Blob, Hash, InodeNumber, MemoryObjectStore, Overlay, PathComponent, RelativePath, Tree,
    TreeEntry, TreeEntryKind,
};
use canopy_fuse::inode::tree::DirListEntry;
use canopy_fuse::{
    Dispatcher, FileInode, FsResult, InodePtr, Mount, MountConfig, RequestContext, TreeInode,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// A deterministic content address for fixtures.
pub fn test_hash(n: u64) -> Hash {
    let mut bytes = [0u8; Hash::LEN];
    bytes[..8].copy_from_slice(&n.to_be_bytes());
    bytes[Hash::LEN - 1] = 0x5a;
    Hash::from_bytes(bytes)
}

/// Declarative fixture for building trees in the object store.
pub enum TreeSpec {
    File(&'static str, &'static [u8]),
    Exec(&'static str, &'static [u8]),
    Symlink(&'static str, &'static [u8]),
    Dir(&'static str, Vec<TreeSpec>),
}

static NEXT_FIXTURE_HASH: AtomicU64 = AtomicU64::new(0x1000);

fn fixture_hash() -> Hash {
    test_hash(NEXT_FIXTURE_HASH.fetch_add(1, Ordering::Relaxed))
}

/// Insert `children` as a tree (recursively inserting blobs and subtrees)
/// and return the tree's hash.
pub fn build_tree(store: &MemoryObjectStore, children: Vec<TreeSpec>) -> Hash {
    let mut entries = Vec::new();
    for child in children {
        let entry = match child {
            TreeSpec::File(name, data) => TreeEntry::new(
                name.parse().unwrap(),
                TreeEntryKind::Regular,
                store.insert_blob(Blob::new(fixture_hash(), data.to_vec())),
            ),
            TreeSpec::Exec(name, data) => TreeEntry::new(
                name.parse().unwrap(),
                TreeEntryKind::Executable,
                store.insert_blob(Blob::new(fixture_hash(), data.to_vec())),
            ),
            TreeSpec::Symlink(name, target) => TreeEntry::new(
                name.parse().unwrap(),
                TreeEntryKind::Symlink,
                store.insert_blob(Blob::new(fixture_hash(), target.to_vec())),
            ),
            TreeSpec::Dir(name, grandchildren) => TreeEntry::new(
                name.parse().unwrap(),
                TreeEntryKind::Tree,
                build_tree(store, grandchildren),
            ),
        };
        entries.push(entry);
    }
    store.insert_tree(Tree::new(fixture_hash(), entries))
}

pub struct TestMount {
    pub mount: Arc<Mount>,
    pub store: Arc<MemoryObjectStore>,
    pub dispatcher: Dispatcher,
    pub root_tree: Option<Hash>,
    _overlay_dir: TempDir,
}

impl TestMount {
    /// Mount a fixture tree.
    pub async fn with_tree(children: Vec<TreeSpec>) -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let root_tree = build_tree(&store, children);
        Self::open(store, Some(root_tree)).await
    }

    /// Mount with an empty, materialized root.
    pub async fn empty() -> Self {
        Self::open(Arc::new(MemoryObjectStore::new()), None).await
    }

    pub async fn open(store: Arc<MemoryObjectStore>, root_tree: Option<Hash>) -> Self {
        let overlay_dir = TempDir::new().expect("failed to create overlay dir");
        let overlay = Overlay::open(overlay_dir.path()).expect("failed to open overlay");
        let mount = Mount::open(
            Arc::clone(&store) as Arc<dyn canopy_core::ObjectStore>,
            overlay,
            MountConfig::default(),
            root_tree,
        )
        .await
        .expect("failed to open mount");
        TestMount {
            dispatcher: Dispatcher::new(Arc::clone(&mount)),
            mount,
            store,
            root_tree,
            _overlay_dir: overlay_dir,
        }
    }

    pub fn ctx(&self) -> RequestContext {
        RequestContext::internal()
    }

    pub fn name(&self, name: &str) -> PathComponent {
        name.parse().expect("invalid path component")
    }

    pub fn path(&self, path: &str) -> RelativePath {
        path.parse().expect("invalid path")
    }

    pub async fn resolve(&self, path: &str) -> FsResult<InodePtr> {
        self.mount.resolve(&self.path(path)).await
    }

    pub async fn resolve_tree(&self, path: &str) -> Arc<TreeInode> {
        self.resolve(path)
            .await
            .expect("path did not resolve")
            .as_tree()
            .expect("path is not a directory")
    }

    pub async fn resolve_file(&self, path: &str) -> Arc<FileInode> {
        self.resolve(path)
            .await
            .expect("path did not resolve")
            .as_file()
            .expect("path is not a file")
    }

    pub async fn read(&self, path: &str) -> Vec<u8> {
        self.resolve_file(path).await.read_all().await.expect("read failed")
    }

    /// Overwrite a file's contents entirely.
    pub async fn write(&self, path: &str, data: &[u8]) {
        let file = self.resolve_file(path).await;
        file.truncate(0).await.expect("truncate failed");
        file.write(0, data).await.expect("write failed");
    }

    pub async fn listing(&self, path: &str) -> Vec<String> {
        self.resolve_tree(path)
            .await
            .readdir()
            .await
            .into_iter()
            .map(|DirListEntry { name, .. }| name.as_str().to_string())
            .collect()
    }

    pub async fn create(&self, dir: &str, name: &str) -> Arc<FileInode> {
        self.resolve_tree(dir)
            .await
            .create(&self.name(name), 0o644, &self.ctx())
            .await
            .expect("create failed")
    }

    pub async fn mkdir(&self, dir: &str, name: &str) -> Arc<TreeInode> {
        self.resolve_tree(dir)
            .await
            .mkdir(&self.name(name), 0o755, &self.ctx())
            .await
            .expect("mkdir failed")
    }

    pub async fn unlink(&self, dir: &str, name: &str) -> FsResult<()> {
        self.resolve_tree(dir)
            .await
            .unlink(&self.name(name), &self.ctx())
            .await
    }

    pub async fn rmdir(&self, dir: &str, name: &str) -> FsResult<()> {
        self.resolve_tree(dir)
            .await
            .rmdir(&self.name(name), &self.ctx())
            .await
    }

    pub async fn rename(
        &self,
        src_dir: &str,
        src_name: &str,
        dest_dir: &str,
        dest_name: &str,
    ) -> FsResult<()> {
        let src = self.resolve_tree(src_dir).await;
        let dest = self.resolve_tree(dest_dir).await;
        src.rename(&self.name(src_name), &dest, &self.name(dest_name), &self.ctx())
            .await
    }

    pub async fn inode_number(&self, path: &str) -> InodeNumber {
        self.resolve(path)
            .await
            .expect("path did not resolve")
            .number()
    }
}
