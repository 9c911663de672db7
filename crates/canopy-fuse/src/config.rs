//! Mount configuration.

use std::time::Duration;

/// Tunables for a mounted filesystem.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// How long the kernel may cache attributes.
    pub attr_ttl: Duration,
    /// How long the kernel may cache (positive) entry lookups.
    pub entry_ttl: Duration,
    /// Owner reported in attributes. Defaults to the current user.
    pub uid: u32,
    /// Group reported in attributes. Defaults to the current group.
    pub gid: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        // SAFETY: getuid/getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        MountConfig {
            attr_ttl: Duration::from_secs(1),
            entry_ttl: Duration::from_secs(1),
            uid,
            gid,
        }
    }
}
