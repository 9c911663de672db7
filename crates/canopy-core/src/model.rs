//! Content addresses, immutable source-control objects, and inode numbers.

use crate::path::PathComponent;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

/// A fixed-width content address referencing an immutable tree or blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; Hash::LEN]);

impl Hash {
    pub const LEN: usize = 20;

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Hash(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let raw = hex::decode(s).map_err(|_| HashError::BadHex(s.to_string()))?;
        let bytes: [u8; Self::LEN] = raw
            .try_into()
            .map_err(|_| HashError::BadLength { got: s.len() / 2 })?;
        Ok(Hash(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(D::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid hex in hash: {0:?}")]
    BadHex(String),
    #[error("hash must be {expected} bytes, got {got}", expected = Hash::LEN)]
    BadLength { got: usize },
}

/// A stable 64-bit inode identifier.
///
/// Numbers are allocated monotonically and never reused for the lifetime of
/// a mount. The root and the reserved sentinel directory have fixed values.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    /// The root directory (FUSE convention).
    pub const ROOT: InodeNumber = InodeNumber(1);
    /// The reserved sentinel directory directly under the root.
    pub const RESERVED: InodeNumber = InodeNumber(2);
    /// First number handed out by the allocator.
    pub const FIRST_ALLOCATED: u64 = 3;

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ino:{}", self.0)
    }
}

/// The type of a source-control tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEntryKind {
    Regular,
    Executable,
    Symlink,
    Tree,
}

impl TreeEntryKind {
    /// The full st_mode (file type + permission bits) for a freshly
    /// projected entry of this kind.
    pub fn initial_mode(self) -> u32 {
        match self {
            TreeEntryKind::Regular => libc::S_IFREG as u32 | 0o644,
            TreeEntryKind::Executable => libc::S_IFREG as u32 | 0o755,
            TreeEntryKind::Symlink => libc::S_IFLNK as u32 | 0o777,
            TreeEntryKind::Tree => libc::S_IFDIR as u32 | 0o755,
        }
    }

    pub fn is_tree(self) -> bool {
        matches!(self, TreeEntryKind::Tree)
    }
}

/// One child of a source-control [`Tree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: PathComponent,
    pub kind: TreeEntryKind,
    pub hash: Hash,
}

impl TreeEntry {
    pub fn new(name: PathComponent, kind: TreeEntryKind, hash: Hash) -> Self {
        TreeEntry { name, kind, hash }
    }

    pub fn is_tree(&self) -> bool {
        self.kind.is_tree()
    }
}

/// An immutable source-control directory listing.
///
/// Entries are strictly sorted by name; the diff and checkout merge walks
/// depend on this ordering matching the in-memory entry maps.
#[derive(Debug, Clone)]
pub struct Tree {
    hash: Hash,
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(hash: Hash, mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        Tree { hash, entries }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn find(&self, name: &PathComponent) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }
}

/// Immutable file contents addressed by hash.
#[derive(Debug, Clone)]
pub struct Blob {
    hash: Hash,
    data: Vec<u8>,
}

impl Blob {
    pub fn new(hash: Hash, data: Vec<u8>) -> Self {
        Blob { hash, data }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Access/change/modification times for one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Timestamps {
    pub fn all(at: SystemTime) -> Self {
        Timestamps {
            atime: at,
            mtime: at,
            ctime: at,
        }
    }

    pub fn now() -> Self {
        Self::all(SystemTime::now())
    }

    /// Bump mtime and ctime after a content or entry change.
    pub fn touch_modified(&mut self, now: SystemTime) {
        self.mtime = now;
        self.ctime = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> Hash {
        Hash::from_bytes([n; Hash::LEN])
    }

    #[test]
    fn hash_hex_round_trip() {
        let h = hash(0xab);
        let parsed = Hash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn hash_rejects_bad_input() {
        assert!(Hash::from_hex("zz").is_err());
        assert!(Hash::from_hex("abcd").is_err());
    }

    #[test]
    fn tree_sorts_entries() {
        let tree = Tree::new(
            hash(1),
            vec![
                TreeEntry::new("b".parse().unwrap(), TreeEntryKind::Regular, hash(2)),
                TreeEntry::new("a".parse().unwrap(), TreeEntryKind::Regular, hash(3)),
            ],
        );
        let names: Vec<_> = tree.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn tree_find_uses_binary_search() {
        let entries = (0..10u8)
            .map(|i| {
                TreeEntry::new(
                    format!("f{i}").parse().unwrap(),
                    TreeEntryKind::Regular,
                    hash(i),
                )
            })
            .collect();
        let tree = Tree::new(hash(0xff), entries);
        assert_eq!(tree.find(&"f7".parse().unwrap()).unwrap().hash, hash(7));
        assert!(tree.find(&"nope".parse().unwrap()).is_none());
    }

    #[test]
    fn kind_modes() {
        assert_eq!(
            TreeEntryKind::Tree.initial_mode() & libc::S_IFMT as u32,
            libc::S_IFDIR as u32
        );
        assert_eq!(TreeEntryKind::Executable.initial_mode() & 0o777, 0o755);
        assert_eq!(
            TreeEntryKind::Symlink.initial_mode() & libc::S_IFMT as u32,
            libc::S_IFLNK as u32
        );
    }
}
