//! Error handling and errno mapping for the filesystem layer.
//!
//! Every operation resolves to success, a typed filesystem error translated
//! to a numeric errno at the kernel boundary, or an internal bug which is
//! logged at high severity and surfaced as `EIO`.

use canopy_core::{OverlayError, StoreError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    /// Path does not exist.
    #[error("no such file or directory")]
    NotFound,

    /// Name already present in the directory.
    #[error("file already exists")]
    AlreadyExists,

    /// A directory was required but the entry is not one.
    #[error("not a directory")]
    NotDir,

    /// A non-directory was required but the entry is a directory.
    #[error("is a directory")]
    IsDir,

    /// rmdir of a non-empty directory, or rename over one.
    #[error("directory not empty")]
    NotEmpty,

    /// Structurally invalid request (e.g. rename into own descendant).
    #[error("invalid argument")]
    Invalid,

    /// Hard links, reserved-directory edits, non-socket mknod.
    #[error("operation not permitted")]
    NotPermitted,

    /// The entry changed underneath the caller; retry after reloading.
    /// Internal sentinel for the bounded remove retry loop.
    #[error("entry changed during operation")]
    Retry,

    /// The inode was unlinked or can no longer be resolved by number.
    #[error("stale inode")]
    Stale,

    /// The per-request interrupt flag was raised.
    #[error("interrupted")]
    Interrupted,

    #[error("operation not supported")]
    NotSupported,

    /// No such extended attribute.
    #[error("no such xattr")]
    NoXattr,

    /// An in-flight inode load failed; delivered to every pending waiter.
    #[error("inode {ino} failed to load: {message}")]
    LoadFailed { ino: u64, message: String },

    #[error("object store error: {0}")]
    Store(#[from] StoreError),

    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An internal invariant was violated. Logged by [`fs_bug!`] before
    /// construction; never silently ignored.
    #[error("internal error: {0}")]
    Bug(String),
}

impl FsError {
    /// Converts this error to a libc error code for the kernel boundary.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotDir => libc::ENOTDIR,
            FsError::IsDir => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Invalid => libc::EINVAL,
            FsError::NotPermitted => libc::EPERM,
            FsError::Retry => libc::EBADF,
            FsError::Stale => libc::ESTALE,
            FsError::Interrupted => libc::EINTR,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::NoXattr => libc::ENODATA,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::Store(_)
            | FsError::Overlay(_)
            | FsError::LoadFailed { .. }
            | FsError::Bug(_) => libc::EIO,
        }
    }
}

/// Result type for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Report an internal invariant violation: logs at error level and
/// evaluates to an [`FsError::Bug`].
#[macro_export]
macro_rules! fs_bug {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(target: "canopy_fuse::bug", "{}", message);
        $crate::error::FsError::Bug(message)
    }};
}
