//! The object-store surface: immutable trees and blobs fetched by hash.

use crate::model::{Blob, Hash, Tree};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {0} not present in the object store")]
    NotFound(Hash),
    #[error("object store I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// External, read-only content-addressed store of immutable trees and blobs.
///
/// Results for a given hash never change, so callers may cache them freely
/// and concurrent fetches of the same hash may be shared.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_tree(&self, hash: Hash) -> Result<Arc<Tree>, StoreError>;
    async fn get_blob(&self, hash: Hash) -> Result<Arc<Blob>, StoreError>;
}

/// In-memory object store.
///
/// Backs tests and local fixtures. Fetches are counted per hash so tests can
/// assert that lazy loading touches the store exactly once per object.
#[derive(Default)]
pub struct MemoryObjectStore {
    inner: Mutex<MemoryStoreState>,
}

#[derive(Default)]
struct MemoryStoreState {
    trees: HashMap<Hash, Arc<Tree>>,
    blobs: HashMap<Hash, Arc<Blob>>,
    tree_fetches: HashMap<Hash, u64>,
    blob_fetches: HashMap<Hash, u64>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tree(&self, tree: Tree) -> Hash {
        let hash = tree.hash();
        self.inner
            .lock()
            .unwrap()
            .trees
            .insert(hash, Arc::new(tree));
        hash
    }

    pub fn insert_blob(&self, blob: Blob) -> Hash {
        let hash = blob.hash();
        self.inner
            .lock()
            .unwrap()
            .blobs
            .insert(hash, Arc::new(blob));
        hash
    }

    /// How many times `get_tree` was called for `hash`.
    pub fn tree_fetch_count(&self, hash: Hash) -> u64 {
        *self
            .inner
            .lock()
            .unwrap()
            .tree_fetches
            .get(&hash)
            .unwrap_or(&0)
    }

    /// How many times `get_blob` was called for `hash`.
    pub fn blob_fetch_count(&self, hash: Hash) -> u64 {
        *self
            .inner
            .lock()
            .unwrap()
            .blob_fetches
            .get(&hash)
            .unwrap_or(&0)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_tree(&self, hash: Hash) -> Result<Arc<Tree>, StoreError> {
        let mut state = self.inner.lock().unwrap();
        *state.tree_fetches.entry(hash).or_insert(0) += 1;
        state
            .trees
            .get(&hash)
            .cloned()
            .ok_or(StoreError::NotFound(hash))
    }

    async fn get_blob(&self, hash: Hash) -> Result<Arc<Blob>, StoreError> {
        let mut state = self.inner.lock().unwrap();
        *state.blob_fetches.entry(hash).or_insert(0) += 1;
        state
            .blobs
            .get(&hash)
            .cloned()
            .ok_or(StoreError::NotFound(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TreeEntry, TreeEntryKind};

    fn hash(n: u8) -> Hash {
        Hash::from_bytes([n; Hash::LEN])
    }

    #[tokio::test]
    async fn fetches_and_counts() {
        let store = MemoryObjectStore::new();
        let blob_hash = store.insert_blob(Blob::new(hash(1), b"contents".to_vec()));
        let tree_hash = store.insert_tree(Tree::new(
            hash(2),
            vec![TreeEntry::new(
                "a".parse().unwrap(),
                TreeEntryKind::Regular,
                blob_hash,
            )],
        ));

        assert_eq!(store.tree_fetch_count(tree_hash), 0);
        let tree = store.get_tree(tree_hash).await.unwrap();
        assert_eq!(tree.entries().len(), 1);
        store.get_tree(tree_hash).await.unwrap();
        assert_eq!(store.tree_fetch_count(tree_hash), 2);

        let blob = store.get_blob(blob_hash).await.unwrap();
        assert_eq!(blob.data(), b"contents");
        assert_eq!(store.blob_fetch_count(blob_hash), 1);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.get_blob(hash(9)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(h) if h == hash(9)));
    }
}
