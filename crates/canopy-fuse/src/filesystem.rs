//! The `fuser` bridge: translates kernel callbacks into dispatcher calls.
//!
//! Each callback builds a kernel-origin [`RequestContext`], runs the typed
//! operation on the tokio runtime, and converts the reply or error into a
//! `fuser` reply. All filesystem logic lives below the dispatcher; this
//! layer is intentionally mechanical.

use crate::dispatch::Dispatcher;
use crate::error::FsResult;
use crate::inode::InodeAttr;
use crate::mount::{InvalidationSink, Mount};
use crate::request::RequestContext;
use canopy_core::{InodeNumber, PathComponent};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info};

/// Block size reported in attributes and statfs.
const BLOCK_SIZE: u32 = 4096;

pub struct CanopyFs {
    dispatcher: Arc<Dispatcher>,
    handle: Handle,
    /// Owned runtime when one was not supplied. Declared after `handle` so
    /// it drops last.
    _owned_runtime: Option<Runtime>,
}

impl CanopyFs {
    /// Wrap `mount` with a dedicated multi-threaded runtime.
    pub fn new(mount: Arc<Mount>) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(CanopyFs {
            dispatcher: Arc::new(Dispatcher::new(mount)),
            handle,
            _owned_runtime: Some(runtime),
        })
    }

    /// Wrap `mount` using an externally managed runtime.
    pub fn with_runtime_handle(mount: Arc<Mount>, handle: Handle) -> Self {
        CanopyFs {
            dispatcher: Arc::new(Dispatcher::new(mount)),
            handle,
            _owned_runtime: None,
        }
    }

    pub fn mount(&self) -> &Arc<Mount> {
        self.dispatcher.mount()
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    fn to_file_attr(&self, attr: InodeAttr) -> FileAttr {
        let config = self.mount().config();
        FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.size.div_ceil(BLOCK_SIZE as u64),
            atime: attr.timestamps.atime,
            mtime: attr.timestamps.mtime,
            ctime: attr.timestamps.ctime,
            crtime: attr.timestamps.mtime,
            kind: file_type(attr.mode),
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink,
            uid: config.uid,
            gid: config.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn reply_entry(&self, result: FsResult<crate::dispatch::EntryReply>, reply: ReplyEntry) {
        match result {
            Ok(entry) => {
                let attr = self.to_file_attr(entry.attr);
                reply.entry(&entry.entry_ttl, &attr, entry.generation);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn os_name(name: &OsStr) -> Option<&str> {
    name.to_str()
}

impl Filesystem for CanopyFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = os_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = RequestContext::kernel();
        let result = self.block_on(self.dispatcher.lookup(&ctx, parent, name));
        self.reply_entry(result, reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.block_on(self.dispatcher.forget(ino, nlookup));
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.getattr(&ctx, ino)) {
            Ok(attr) => reply.attr(&self.mount().config().attr_ttl, &self.to_file_attr(attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.setattr(&ctx, ino, mode, size)) {
            Ok(attr) => reply.attr(&self.mount().config().attr_ttl, &self.to_file_attr(attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.readlink(&ctx, ino)) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = os_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = RequestContext::kernel();
        let result = self.block_on(self.dispatcher.mknod(&ctx, parent, name, mode));
        self.reply_entry(result, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = os_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = RequestContext::kernel();
        let result = self.block_on(self.dispatcher.mkdir(&ctx, parent, name, mode));
        self.reply_entry(result, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = os_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.unlink(&ctx, parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = os_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.rmdir(&ctx, parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(name) = os_name(link_name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let target = target.as_os_str().as_encoded_bytes();
        let ctx = RequestContext::kernel();
        let result = self.block_on(self.dispatcher.symlink(&ctx, parent, name, target));
        self.reply_entry(result, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (os_name(name), os_name(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = RequestContext::kernel();
        match self.block_on(
            self.dispatcher
                .rename(&ctx, parent, name, newparent, newname),
        ) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let name = os_name(newname).unwrap_or("<invalid>");
        let ctx = RequestContext::kernel();
        let result = self.block_on(self.dispatcher.link(&ctx, ino, name));
        self.reply_entry(result, reply);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = os_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.create(&ctx, parent, name, mode)) {
            Ok((entry, fh)) => {
                let attr = self.to_file_attr(entry.attr);
                reply.created(&entry.entry_ttl, &attr, entry.generation, fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.open(&ctx, ino)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.read(&ctx, ino, offset.max(0) as u64, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.write(&ctx, ino, offset.max(0) as u64, data)) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.block_on(self.dispatcher.release(fh));
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.opendir(&ctx, ino)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let ctx = RequestContext::kernel();
        let offset = offset.max(0) as u64;
        match self.block_on(self.dispatcher.readdir(&ctx, fh, offset)) {
            Ok(entries) => {
                for (index, entry) in entries.iter().enumerate() {
                    let next_offset = offset as i64 + index as i64 + 1;
                    // Inode 0 entries have no number assigned yet; report a
                    // placeholder the kernel resolves through lookup.
                    let ino = if entry.ino == 0 { u64::MAX } else { entry.ino };
                    if reply.add(ino, next_offset, file_type(entry.mode), &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.block_on(self.dispatcher.releasedir(fh));
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let statfs = self.dispatcher.statfs();
        reply.statfs(
            0,
            0,
            0,
            0,
            0,
            statfs.block_size,
            statfs.name_max,
            statfs.block_size,
        );
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        let Some(name) = os_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.getxattr(&ctx, ino, name)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.listxattr(&ctx, ino)) {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else {
                    reply.data(&data);
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let ctx = RequestContext::kernel();
        match self.block_on(self.dispatcher.access(&ctx, ino)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

/// Invalidation sink backed by the kernel notifier.
struct FuseInvalidator {
    notifier: fuser::Notifier,
}

impl InvalidationSink for FuseInvalidator {
    fn invalidate_entry(&self, parent: InodeNumber, name: &PathComponent) {
        if let Err(e) = self
            .notifier
            .inval_entry(parent.get(), OsStr::new(name.as_str()))
        {
            debug!(parent = parent.get(), name = name.as_str(), error = %e,
                   "kernel entry invalidation failed");
        }
    }
}

/// Mount `mount` at `mountpoint` on a background session, wiring the
/// kernel invalidation callback back into the mount.
pub fn spawn_mount(
    mount: Arc<Mount>,
    mountpoint: &Path,
    options: &[MountOption],
) -> io::Result<fuser::BackgroundSession> {
    let fs = CanopyFs::new(Arc::clone(&mount))?;
    let session = fuser::Session::new(fs, mountpoint, options)?;
    mount.set_invalidation_sink(Box::new(FuseInvalidator {
        notifier: session.notifier(),
    }));
    session.spawn()
}
