//! Core model and store surfaces for canopyfs.
//!
//! This crate holds everything the inode layer builds on but that is not
//! itself tied to a kernel bridge: content hashes and immutable source
//! control objects, typed paths, the object-store and overlay surfaces, the
//! mutation journal, and gitignore rule matching.

pub mod ignore;
pub mod journal;
pub mod model;
pub mod overlay;
pub mod path;
pub mod store;

pub use ignore::{IgnoreFile, IgnoreStack};
pub use journal::{Journal, JournalChange, JournalDelta};
pub use model::{Blob, Hash, InodeNumber, Timestamps, Tree, TreeEntry, TreeEntryKind};
pub use overlay::{Overlay, OverlayDir, OverlayEntry, OverlayError};
pub use path::{PathComponent, PathError, RelativePath};
pub use store::{MemoryObjectStore, ObjectStore, StoreError};
