//! The overlay: on-disk side store for local mutations.
//!
//! Materialized directories persist their authoritative listing as
//! `dirs/<ino>`, materialized files keep their bytes in `files/<ino>`, and
//! the inode-number allocation counter lives in `next-inode`. Directory
//! files start with a one-byte format header so that a foreign or truncated
//! file is detected as corruption rather than parsed as JSON.

use crate::model::{Hash, InodeNumber, Timestamps};
use crate::path::PathComponent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Format header for serialized directory listings.
const DIR_HEADER: u8 = 0x01;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("overlay I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt overlay data for inode {ino}: {reason}")]
    Corrupt { ino: InodeNumber, reason: String },
}

/// One persisted child entry of a materialized directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayEntry {
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode_number: Option<InodeNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Hash>,
}

/// The persisted form of a directory's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayDir {
    pub timestamps: Timestamps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_hash: Option<Hash>,
    pub entries: BTreeMap<PathComponent, OverlayEntry>,
}

/// Side store for local mutations, keyed by inode number.
pub struct Overlay {
    dirs: PathBuf,
    files: PathBuf,
    next_inode_path: PathBuf,
}

impl Overlay {
    /// Open (creating if necessary) an overlay rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, OverlayError> {
        let dirs = root.join("dirs");
        let files = root.join("files");
        fs::create_dir_all(&dirs)?;
        fs::create_dir_all(&files)?;
        Ok(Overlay {
            dirs,
            files,
            next_inode_path: root.join("next-inode"),
        })
    }

    fn dir_path(&self, ino: InodeNumber) -> PathBuf {
        self.dirs.join(ino.get().to_string())
    }

    /// Path of the backing file holding a materialized file's contents.
    pub fn file_path(&self, ino: InodeNumber) -> PathBuf {
        self.files.join(ino.get().to_string())
    }

    /// Load the persisted listing for a materialized directory, if present.
    pub fn load_dir(&self, ino: InodeNumber) -> Result<Option<OverlayDir>, OverlayError> {
        let mut raw = Vec::new();
        match fs::File::open(self.dir_path(ino)) {
            Ok(mut f) => f.read_to_end(&mut raw)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some((&header, payload)) = raw.split_first() else {
            return Err(OverlayError::Corrupt {
                ino,
                reason: "empty directory record".to_string(),
            });
        };
        if header != DIR_HEADER {
            return Err(OverlayError::Corrupt {
                ino,
                reason: format!("unknown directory record header {header:#04x}"),
            });
        }
        let dir = serde_json::from_slice(payload).map_err(|e| OverlayError::Corrupt {
            ino,
            reason: e.to_string(),
        })?;
        Ok(Some(dir))
    }

    /// Persist the authoritative listing for a materialized directory.
    pub fn save_dir(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<(), OverlayError> {
        let mut raw = vec![DIR_HEADER];
        serde_json::to_writer(&mut raw, dir).map_err(|e| OverlayError::Corrupt {
            ino,
            reason: e.to_string(),
        })?;
        let path = self.dir_path(ino);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &raw)?;
        fs::rename(&tmp, &path)?;
        debug!(ino = ino.get(), entries = dir.entries.len(), "saved overlay dir");
        Ok(())
    }

    /// Remove the persisted listing after a directory dematerializes.
    pub fn remove_dir(&self, ino: InodeNumber) -> Result<(), OverlayError> {
        match fs::remove_file(self.dir_path(ino)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_dir(&self, ino: InodeNumber) -> bool {
        self.dir_path(ino).exists()
    }

    /// Create the backing file for a freshly materialized file inode,
    /// writing `contents` as its initial bytes.
    pub fn create_file(&self, ino: InodeNumber, contents: &[u8]) -> Result<(), OverlayError> {
        let mut f = fs::File::create(self.file_path(ino))?;
        f.write_all(contents)?;
        Ok(())
    }

    pub fn read_file(&self, ino: InodeNumber) -> Result<Vec<u8>, OverlayError> {
        Ok(fs::read(self.file_path(ino))?)
    }

    pub fn write_file(&self, ino: InodeNumber, contents: &[u8]) -> Result<(), OverlayError> {
        Ok(fs::write(self.file_path(ino), contents)?)
    }

    pub fn file_len(&self, ino: InodeNumber) -> Result<u64, OverlayError> {
        Ok(fs::metadata(self.file_path(ino))?.len())
    }

    pub fn has_file(&self, ino: InodeNumber) -> bool {
        self.file_path(ino).exists()
    }

    /// Remove a materialized file's bytes once the inode is truly gone.
    pub fn remove_file(&self, ino: InodeNumber) -> Result<(), OverlayError> {
        match fs::remove_file(self.file_path(ino)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The persisted inode-allocation counter, if one has been saved.
    pub fn load_next_inode_number(&self) -> Result<Option<u64>, OverlayError> {
        let raw = match fs::read_to_string(&self.next_inode_path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = raw
            .trim()
            .parse::<u64>()
            .map_err(|e| OverlayError::Corrupt {
                ino: InodeNumber(0),
                reason: format!("bad next-inode counter: {e}"),
            })?;
        Ok(Some(value))
    }

    pub fn save_next_inode_number(&self, next: u64) -> Result<(), OverlayError> {
        let tmp = self.next_inode_path.with_extension("tmp");
        fs::write(&tmp, next.to_string())?;
        fs::rename(&tmp, &self.next_inode_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn sample_dir() -> OverlayDir {
        let mut entries = BTreeMap::new();
        entries.insert(
            "hello".parse().unwrap(),
            OverlayEntry {
                mode: libc::S_IFREG as u32 | 0o644,
                inode_number: Some(InodeNumber(7)),
                hash: None,
            },
        );
        entries.insert(
            "sub".parse().unwrap(),
            OverlayEntry {
                mode: libc::S_IFDIR as u32 | 0o755,
                inode_number: None,
                hash: Some(Hash::from_bytes([3; Hash::LEN])),
            },
        );
        OverlayDir {
            timestamps: Timestamps::all(SystemTime::UNIX_EPOCH),
            tree_hash: None,
            entries,
        }
    }

    #[test]
    fn dir_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        let ino = InodeNumber(5);

        assert!(overlay.load_dir(ino).unwrap().is_none());
        let dir = sample_dir();
        overlay.save_dir(ino, &dir).unwrap();
        assert_eq!(overlay.load_dir(ino).unwrap().unwrap(), dir);

        overlay.remove_dir(ino).unwrap();
        assert!(overlay.load_dir(ino).unwrap().is_none());
        // Removing twice is fine.
        overlay.remove_dir(ino).unwrap();
    }

    #[test]
    fn bad_header_is_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        let ino = InodeNumber(9);
        fs::write(tmp.path().join("dirs").join("9"), [0x7f, b'{']).unwrap();
        assert!(matches!(
            overlay.load_dir(ino),
            Err(OverlayError::Corrupt { .. })
        ));
    }

    #[test]
    fn file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        let ino = InodeNumber(11);

        overlay.create_file(ino, b"first").unwrap();
        assert!(overlay.has_file(ino));
        assert_eq!(overlay.read_file(ino).unwrap(), b"first");
        assert_eq!(overlay.file_len(ino).unwrap(), 5);

        overlay.write_file(ino, b"second!").unwrap();
        assert_eq!(overlay.read_file(ino).unwrap(), b"second!");

        overlay.remove_file(ino).unwrap();
        assert!(!overlay.has_file(ino));
    }

    #[test]
    fn next_inode_counter_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = Overlay::open(tmp.path()).unwrap();
        assert_eq!(overlay.load_next_inode_number().unwrap(), None);
        overlay.save_next_inode_number(42).unwrap();
        assert_eq!(overlay.load_next_inode_number().unwrap(), Some(42));
    }
}
