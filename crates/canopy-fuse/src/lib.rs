//! canopy-fuse: the inode graph and kernel bridge of canopyfs.
//!
//! Projects a content-addressed source-control tree as a live, writable
//! directory tree. Unmodified contents are fetched lazily from the object
//! store; local modifications are captured in the overlay and propagate
//! materialization up the parent chain. The two intertwined state machines
//! (materialization and checkout) live on [`inode::TreeInode`].

pub mod checkout;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod filesystem;
pub mod inode;
pub mod mount;
pub mod request;

pub use checkout::{CheckoutConflict, CheckoutMode, CheckoutResult, ConflictType};
pub use config::MountConfig;
pub use diff::{DiffCallback, DiffCollector, DiffResults};
pub use dispatch::{Dispatcher, EntryReply, ReaddirEntry};
pub use error::{FsError, FsResult};
pub use filesystem::{spawn_mount, CanopyFs};
pub use inode::{FileInode, InodeAttr, InodePtr, TreeInode};
pub use mount::{InvalidationSink, Mount, RESERVED_NAME};
pub use request::{RequestContext, RequestOrigin};
