//! The inode map: number allocation, load coordination, and unload.
//!
//! The map owns three tables: loaded inodes (weak pointers; ownership
//! stays with the parent entry tables), unloaded records (enough of the
//! parent chain to resolve an inode number the kernel still remembers), and
//! in-flight loads (the waiter lists that guarantee at most one load per
//! inode number).
//!
//! The table mutex is held only for bookkeeping, never across I/O. The
//! single exception to "no I/O" is persisting the allocation counter, which
//! happens outside the table lock under a dedicated persist lock.

use crate::error::{FsError, FsResult};
use crate::inode::{InodePtr, InodeWeak};
use canopy_core::{InodeNumber, Overlay, PathComponent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A waiter registered for the completion of one inode load.
pub(crate) type LoadWaiter = oneshot::Sender<FsResult<InodePtr>>;

/// Parent-chain record for an inode that is not currently loaded.
#[derive(Debug, Clone)]
pub(crate) struct UnloadedRecord {
    pub parent: InodeNumber,
    pub name: PathComponent,
    /// Outstanding kernel references carried while unloaded.
    pub fuse_refcount: u64,
}

#[derive(Default)]
struct MapState {
    next_number: u64,
    loaded: HashMap<InodeNumber, InodeWeak>,
    /// Unlinked inodes kept alive because the kernel still references them.
    unlinked_held: HashMap<InodeNumber, InodePtr>,
    unloaded: HashMap<InodeNumber, UnloadedRecord>,
    loading: HashMap<InodeNumber, Vec<LoadWaiter>>,
}

pub(crate) struct InodeMap {
    overlay: Arc<Overlay>,
    state: Mutex<MapState>,
    /// Serializes allocation-counter persistence; ordered by value so a
    /// stale smaller counter never overwrites a newer one.
    persist: Mutex<u64>,
    /// Exclusive privilege to unload inodes.
    unload_lock: tokio::sync::Mutex<()>,
}

impl InodeMap {
    pub(crate) fn new(overlay: Arc<Overlay>) -> FsResult<Self> {
        let next = overlay
            .load_next_inode_number()?
            .unwrap_or(InodeNumber::FIRST_ALLOCATED)
            .max(InodeNumber::FIRST_ALLOCATED);
        Ok(InodeMap {
            overlay,
            state: Mutex::new(MapState {
                next_number: next,
                ..MapState::default()
            }),
            persist: Mutex::new(0),
            unload_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns a fresh, never-before-used inode number and persists the
    /// counter so numbers survive a remount.
    pub(crate) fn allocate_inode_number(&self) -> FsResult<InodeNumber> {
        let number = {
            let mut state = self.state.lock();
            let n = state.next_number;
            state.next_number += 1;
            n
        };
        {
            let mut persisted = self.persist.lock();
            if number + 1 > *persisted {
                self.overlay.save_next_inode_number(number + 1)?;
                *persisted = number + 1;
            }
        }
        Ok(InodeNumber(number))
    }

    /// Register a root-like inode that is loaded for the mount's lifetime.
    pub(crate) fn register_loaded(&self, ptr: &InodePtr) {
        self.state.lock().loaded.insert(ptr.number(), ptr.downgrade());
    }

    /// Record a freshly created (not loaded-from-store) inode.
    pub(crate) fn inode_created(&self, ptr: &InodePtr) {
        self.state.lock().loaded.insert(ptr.number(), ptr.downgrade());
    }

    pub(crate) fn get_loaded(&self, number: InodeNumber) -> Option<InodePtr> {
        let state = self.state.lock();
        if let Some(ptr) = state.unlinked_held.get(&number) {
            return Some(ptr.clone());
        }
        state.loaded.get(&number).and_then(InodeWeak::upgrade)
    }

    pub(crate) fn is_loaded(&self, number: InodeNumber) -> bool {
        self.get_loaded(number).is_some()
    }

    /// Register `waiter` for the load of `number`; returns true iff the
    /// caller must start the load (no prior load in flight). The parent
    /// chain record is stored so `lookup_inode` can resolve the number
    /// while the load is outstanding or after an unload.
    pub(crate) fn should_load_child(
        &self,
        parent: InodeNumber,
        name: &PathComponent,
        number: InodeNumber,
        waiter: LoadWaiter,
    ) -> bool {
        let mut state = self.state.lock();
        state
            .unloaded
            .entry(number)
            .or_insert_with(|| UnloadedRecord {
                parent,
                name: name.clone(),
                fuse_refcount: 0,
            });
        let waiters = state.loading.entry(number).or_default();
        waiters.push(waiter);
        waiters.len() == 1
    }

    /// Record a completed load. Returns the waiters; the caller fulfills
    /// them only after releasing the parent's contents lock.
    pub(crate) fn inode_load_complete(&self, ptr: &InodePtr) -> Vec<LoadWaiter> {
        let number = ptr.number();
        let mut state = self.state.lock();
        if let Some(record) = state.unloaded.remove(&number) {
            if record.fuse_refcount > 0 {
                ptr.core().add_fuse_refcount(record.fuse_refcount);
            }
        }
        state.loaded.insert(number, ptr.downgrade());
        state.loading.remove(&number).unwrap_or_default()
    }

    /// Cancel a failed load, delivering the failure to every waiter. The
    /// inode number stays allocated; it is never reused.
    pub(crate) fn inode_load_failed(&self, number: InodeNumber, message: &str) {
        warn!(ino = number.get(), message, "inode load failed");
        let waiters = {
            let mut state = self.state.lock();
            state.loading.remove(&number).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(FsError::LoadFailed {
                ino: number.get(),
                message: message.to_string(),
            }));
        }
    }

    /// The parent-chain record for a not-loaded inode number, if known.
    pub(crate) fn record_for(&self, number: InodeNumber) -> Option<UnloadedRecord> {
        self.state.lock().unloaded.get(&number).cloned()
    }

    /// Keep an unlinked inode alive while the kernel still references it.
    pub(crate) fn remember_unlinked(&self, ptr: &InodePtr) {
        if ptr.core().fuse_refcount() > 0 {
            self.state
                .lock()
                .unlinked_held
                .insert(ptr.number(), ptr.clone());
        }
    }

    /// The kernel forgot `count` references to `number`. Returns an inode
    /// that became eligible for unload, if any; the caller drives
    /// [`InodeMap::try_unload`] outside the table lock.
    pub(crate) fn dec_fuse_refcount(
        &self,
        number: InodeNumber,
        count: u64,
    ) -> Option<InodePtr> {
        let mut state = self.state.lock();
        let loaded = state.loaded.get(&number).and_then(InodeWeak::upgrade);
        if let Some(ptr) = loaded {
            let remaining = ptr.core().dec_fuse_refcount(count);
            if remaining == 0 {
                if ptr.core().is_unlinked() {
                    // Last kernel reference to an unlinked inode: release
                    // our keep-alive; the object is destroyed when the last
                    // strong reference drops.
                    state.unlinked_held.remove(&number);
                    state.loaded.remove(&number);
                    return None;
                }
                return Some(ptr);
            }
            return None;
        }
        if let Some(record) = state.unloaded.get_mut(&number) {
            record.fuse_refcount = record.fuse_refcount.saturating_sub(count);
            if record.fuse_refcount == 0 {
                state.unloaded.remove(&number);
            }
        }
        None
    }

    /// Unload `inode` if it is still eligible: kernel refcount zero, no
    /// loaded children, and the parent's entry pointer is the only other
    /// strong reference. Runs under the map's unload lock and the parent's
    /// contents write lock so a concurrent lookup cannot resurrect a
    /// half-destroyed inode.
    pub(crate) async fn try_unload(&self, inode: InodePtr) {
        let _unload = self.unload_lock.lock().await;

        let number = inode.number();
        if number == InodeNumber::ROOT || number == InodeNumber::RESERVED {
            return;
        }
        let location = inode.core().location_snapshot();
        if location.unlinked {
            return;
        }
        let Some((parent_number, name)) = location.parent else {
            return;
        };
        let Some(parent) = self.get_loaded(parent_number).and_then(|p| p.as_tree()) else {
            return;
        };

        let mut contents = parent.contents_write().await;
        if inode.core().fuse_refcount() != 0 {
            return;
        }
        let Some(entry) = contents.entries.get_mut(&name) else {
            return;
        };
        match &entry.loaded {
            Some(ptr) if ptr.ptr_eq(&inode) => {}
            _ => return,
        }
        // A tree with a loaded child must stay resident: children hold
        // only a non-owning back edge, so dropping the tree would strand
        // them with a parent number the map can no longer resolve. The
        // guard is held until the unload completes so no child can load
        // in between.
        let child_contents = match &inode {
            InodePtr::Tree(tree) => {
                let guard = tree.contents.read().await;
                if guard.entries.values().any(|e| e.loaded.is_some()) {
                    return;
                }
                Some(guard)
            }
            InodePtr::File(_) => None,
        };
        // Strong refs at this point: the entry pointer and our argument.
        // Anything beyond that is a concurrent user; leave the inode alone.
        if inode.strong_count() > 2 {
            return;
        }
        entry.loaded = None;
        self.state.lock().loaded.remove(&number);
        drop(child_contents);
        debug!(ino = number.get(), "unloaded inode");
    }
}
