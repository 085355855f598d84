// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use fuser::consts::*;
use fuser::{
    FileAttr,
    FileType,
    ReplyAttr,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyOpen,
    ReplyStatfs,
    Request,
    TimeOrNow,
};
use nix::fcntl::OFlag;

use crate::{Attributes, Error, Handle, OsError, Passthrough, Result, Timestamp, Visibility};

/// Extract the ok value from a result, or reply with an error in FUSE
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to FUSE and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err = $err;
        let errno = err.os_error().unwrap_or(libc::EIO);
        if errno == libc::ENOENT {
            tracing::trace!("{err}");
        } else {
            tracing::warn!("{err:?}");
        }
        $reply.error(errno);
        return;
    }};
}

/// A directory entry, as captured when the directory was opened
#[derive(Debug)]
struct Listed {
    ino: u64,
    kind: FileType,
    name: OsString,
}

/// A path known to the kernel, and the number of
/// lookups of it that have not been forgotten yet
#[derive(Debug)]
struct Inode {
    ino: u64,
    lookups: u64,
}

/// Maps the inode based FUSE requests onto the path based
/// [`Passthrough`] driver.
struct Filesystem<V> {
    driver: Passthrough<V>,

    ttl: Duration,
    next_inode: AtomicU64,
    next_handle: AtomicU64,
    paths: DashMap<u64, PathBuf>,
    inodes: DashMap<PathBuf, Inode>,
    dirs: DashMap<u64, Vec<Listed>>,
}

impl<V: Visibility> Filesystem<V> {
    // a realistic block size for tools that compute disk usage
    const BLOCK_SIZE: u32 = 512;

    fn new(driver: Passthrough<V>) -> Self {
        let root = PathBuf::from("/");
        let fs = Self {
            driver,
            // nothing is cached by the kernel, every request is
            // checked against the backing directory again
            ttl: Duration::ZERO,
            next_inode: AtomicU64::new(fuser::FUSE_ROOT_ID + 1),
            // we do not allocate handle 0, so skip it for now
            next_handle: AtomicU64::new(1),
            paths: Default::default(),
            inodes: Default::default(),
            dirs: Default::default(),
        };
        fs.paths.insert(fuser::FUSE_ROOT_ID, root.clone());
        fs.inodes.insert(
            root,
            Inode {
                ino: fuser::FUSE_ROOT_ID,
                lookups: 1,
            },
        );
        fs
    }

    /// Record a lookup of a path, assigning it an inode number if
    /// the kernel does not already know it.
    fn remember(&self, path: PathBuf) -> u64 {
        match self.inodes.entry(path) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let inode = existing.get_mut();
                inode.lookups += 1;
                inode.ino
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let ino = self.next_inode.fetch_add(1, Ordering::Relaxed);
                self.paths.insert(ino, vacant.key().clone());
                vacant.insert(Inode { ino, lookups: 1 });
                ino
            }
        }
    }

    /// Drop `count` lookups of an inode, removing it from the
    /// tables once the kernel holds no more references to it.
    ///
    /// The root inode is never forgotten.
    fn forget(&self, ino: u64, count: u64) {
        if ino == fuser::FUSE_ROOT_ID {
            return;
        }
        let Ok(path) = self.path_of(ino) else {
            return;
        };
        let unused = match self.inodes.get_mut(&path) {
            Some(mut inode) if inode.ino == ino => {
                inode.lookups = inode.lookups.saturating_sub(count);
                inode.lookups == 0
            }
            _ => false,
        };
        // a lookup may have raced in since the count was checked
        let removed = unused
            && self
                .inodes
                .remove_if(&path, |_, inode| inode.ino == ino && inode.lookups == 0)
                .is_some();
        if removed {
            self.paths.remove(&ino);
            tracing::trace!("forget {ino} {path:?}");
        }
    }

    /// The inode number of a path, if the kernel currently knows it
    fn inode_of(&self, path: &Path) -> Option<u64> {
        self.inodes.get(path).map(|inode| inode.ino)
    }

    fn allocate_handle(&self, entries: Vec<Listed>) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.dirs.insert(fh, entries);
        fh
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf> {
        self.paths
            .get(&ino)
            .map(|p| p.value().clone())
            .ok_or(Error::UnknownInode(ino))
    }

    fn attr_from(&self, ino: u64, attrs: &Attributes) -> FileAttr {
        FileAttr {
            ino,
            size: attrs.size,
            blocks: attrs.size.div_ceil(Self::BLOCK_SIZE as u64),
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
            crtime: attrs.ctime,
            kind: file_type(attrs.mode),
            perm: (attrs.mode & 0o7777) as u16, // truncate the non-perm bits
            nlink: u32::try_from(attrs.nlink).unwrap_or(u32::MAX),
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: 0,
            blksize: Self::BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Capture the listing of a directory for [`Filesystem::readdir`].
    ///
    /// Children that the kernel has not looked up are reported with
    /// the inode number of their backing file, and are not added to
    /// the inode tables.
    fn snapshot(&self, ino: u64) -> Result<Vec<Listed>> {
        let path = self.path_of(ino)?;
        let mut entries = Vec::new();
        for name in self.driver.readdir(&path)? {
            let name = name?;
            let (ino, kind) = if name == "." {
                (ino, FileType::Directory)
            } else if name == ".." {
                // the kernel holds a reference to every parent of an open
                // directory, only the root has no parent to look for
                let parent = path
                    .parent()
                    .and_then(|parent| self.inode_of(parent))
                    .unwrap_or(fuser::FUSE_ROOT_ID);
                (parent, FileType::Directory)
            } else {
                let child = path.join(&name);
                let meta = match std::fs::symlink_metadata(self.driver.resolve(&child)) {
                    Ok(meta) => meta,
                    Err(err) => {
                        // most likely removed since it was listed
                        tracing::debug!("opendir {path:?} skipping {name:?}: {err}");
                        continue;
                    }
                };
                let ino = self.inode_of(&child).unwrap_or(meta.ino());
                (ino, file_type(meta.mode()))
            };
            entries.push(Listed { ino, kind, name });
        }
        Ok(entries)
    }

    /// Apply a setattr request, which may only update timestamps.
    fn set_times(
        &self,
        ino: u64,
        changes_content: bool,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<Attributes> {
        let path = self.path_of(ino)?;
        if changes_content {
            tracing::debug!("setattr {path:?} = EROFS");
            return Err(Error::ReadOnly);
        }
        if atime.is_some() || mtime.is_some() {
            let times = (timestamp(atime), timestamp(mtime));
            self.driver.utimens(&path, Some(times))?;
        }
        self.driver.getattr(&path)
    }
}

/// The kind of file described by a set of mode bits
fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn timestamp(time: Option<TimeOrNow>) -> Timestamp {
    match time {
        None => Timestamp::Omit,
        Some(TimeOrNow::Now) => Timestamp::Now,
        Some(TimeOrNow::SpecificTime(time)) => Timestamp::At(time),
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// The entries of a listing that follow `offset`, each paired
/// with the offset that resumes the listing after it.
fn page(entries: &[Listed], offset: i64) -> impl Iterator<Item = (i64, &Listed)> {
    let skip = usize::try_from(offset).unwrap_or_default();
    entries
        .iter()
        .enumerate()
        .skip(skip)
        .map(|(index, entry)| (index as i64 + 1, entry))
}

// these functions mirror the actual fuse ones and
// so we don't have much control over the shape
#[allow(clippy::too_many_arguments)]
impl<V: Visibility> Filesystem<V> {
    fn statfs(&self, ino: u64, reply: ReplyStatfs) {
        let path = unwrap!(reply, self.path_of(ino));
        let stats = unwrap!(reply, self.driver.statfs(&path));
        reply.statfs(
            stats.blocks,
            stats.blocks_free,
            stats.blocks_available,
            stats.files,
            stats.files_free,
            clamp_u32(stats.block_size),
            clamp_u32(stats.name_max),
            clamp_u32(stats.fragment_size),
        )
    }

    fn lookup(&self, parent: u64, name: OsString, reply: ReplyEntry) {
        let parent = unwrap!(reply, self.path_of(parent));
        let path = parent.join(&name);
        tracing::trace!("lookup {path:?}");

        let attrs = unwrap!(reply, self.driver.getattr(&path));
        let ino = self.remember(path);
        reply.entry(&self.ttl, &self.attr_from(ino, &attrs), 0);
    }

    fn getattr(&self, ino: u64, reply: ReplyAttr) {
        let path = unwrap!(reply, self.path_of(ino));
        let attrs = unwrap!(reply, self.driver.getattr(&path));
        reply.attr(&self.ttl, &self.attr_from(ino, &attrs));
    }

    fn setattr(
        &self,
        ino: u64,
        changes_content: bool,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        reply: ReplyAttr,
    ) {
        let attrs = unwrap!(reply, self.set_times(ino, changes_content, atime, mtime));
        reply.attr(&self.ttl, &self.attr_from(ino, &attrs));
    }

    fn readlink(&self, ino: u64, reply: ReplyData) {
        let path = unwrap!(reply, self.path_of(ino));
        let target = unwrap!(reply, self.driver.readlink(&path));
        reply.data(target.as_os_str().as_bytes());
    }

    fn open(&self, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = unwrap!(reply, self.path_of(ino));
        let handle = unwrap!(
            reply,
            self.driver.open(&path, OFlag::from_bits_truncate(flags))
        );
        tracing::trace!("open {ino} = {}", handle.fh());
        reply.opened(handle.fh(), 0);
    }

    fn read(&self, ino: u64, fh: u64, offset: i64, size: u32, reply: ReplyData) {
        let path = self.path_of(ino).unwrap_or_default();
        let handle = unwrap!(reply, Handle::from_fh(fh));
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let data = unwrap!(reply, self.driver.read(&path, handle, size as usize, offset));
        reply.data(&data);
    }

    fn flush(&self, ino: u64, fh: u64, reply: ReplyEmpty) {
        let path = self.path_of(ino).unwrap_or_default();
        let handle = unwrap!(reply, Handle::from_fh(fh));
        unwrap!(reply, self.driver.flush(&path, handle));
        reply.ok();
    }

    fn release(&self, ino: u64, fh: u64, reply: ReplyEmpty) {
        let path = self.path_of(ino).unwrap_or_default();
        let handle = unwrap!(reply, Handle::from_fh(fh));
        unwrap!(reply, self.driver.release(&path, handle));
        reply.ok();
    }

    fn opendir(&self, ino: u64, reply: ReplyOpen) {
        let entries = unwrap!(reply, self.snapshot(ino));
        let fh = self.allocate_handle(entries);
        tracing::trace!("opendir {ino} = {fh}");
        reply.opened(fh, 0);
    }

    fn readdir(&self, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(entries) = self.dirs.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        for (next_offset, entry) in page(&entries, offset) {
            let buffer_full = reply.add(entry.ino, next_offset, entry.kind, &entry.name);
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&self, fh: u64, reply: ReplyEmpty) {
        let Some((_, _entries)) = self.dirs.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        reply.ok()
    }
}

/// Represents a connected FUSE session.
///
/// This implements the [`fuser::Filesystem`] trait, receives all requests
/// and runs each of them on the blocking thread pool of the current tokio
/// runtime, where the [`Passthrough`] driver does the actual work.
pub struct Session<V> {
    fs: Arc<Filesystem<V>>,
}

impl<V: Visibility + 'static> Session<V> {
    /// Construct a new session which serves the provided driver
    /// in its filesystem
    pub fn new(driver: Passthrough<V>) -> Self {
        Self {
            fs: Arc::new(Filesystem::new(driver)),
        }
    }

    fn dispatch<F>(&self, op: F)
    where
        F: FnOnce(&Filesystem<V>) + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn_blocking(move || op(&fs));
    }
}

impl<V: Visibility + 'static> fuser::Filesystem for Session<V> {
    fn init(
        &mut self,
        _req: &Request<'_>,
        config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        const DESIRED: &[(&str, u64)] = &[
            ("FUSE_ASYNC_READ", FUSE_ASYNC_READ),
            #[cfg(feature = "fuse-backend-abi-7-25")]
            ("FUSE_PARALLEL_DIROPS", FUSE_PARALLEL_DIROPS),
            #[cfg(feature = "fuse-backend-abi-7-28")]
            ("FUSE_CACHE_SYMLINKS", FUSE_CACHE_SYMLINKS),
        ];
        let all_desired = DESIRED.iter().fold(0, |prev, (_, i)| prev | i);
        if let Err(unsupported) = config.add_capabilities(all_desired) {
            let rejected = DESIRED
                .iter()
                .filter_map(|d| (d.1 & unsupported != 0).then_some(d.0));
            for name in rejected {
                tracing::warn!("FUSE feature rejected: {name}");
            }
            if let Err(unsupported) = config.add_capabilities(all_desired & !unsupported) {
                tracing::warn!("FUSE features could not be enabled: {unsupported:#x}");
            }
        }
        tracing::info!(root = ?self.fs.driver.root(), "Filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("Filesystem destroyed");
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        self.dispatch(move |fs| fs.statfs(ino, reply));
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        self.dispatch(move |fs| fs.lookup(parent, name, reply));
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.dispatch(move |fs| fs.getattr(ino, reply));
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes_content = mode.is_some()
            || uid.is_some()
            || gid.is_some()
            || size.is_some()
            || flags.is_some();
        self.dispatch(move |fs| fs.setattr(ino, changes_content, atime, mtime, reply));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        self.dispatch(move |fs| fs.readlink(ino, reply));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.dispatch(move |fs| fs.open(ino, flags, reply));
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.dispatch(move |fs| fs.read(ino, fh, offset, size, reply));
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.dispatch(move |fs| fs.flush(ino, fh, reply));
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatch(move |fs| fs.release(ino, fh, reply));
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.dispatch(move |fs| fs.opendir(ino, reply));
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        self.dispatch(move |fs| fs.readdir(fh, offset, reply));
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.dispatch(move |fs| fs.releasedir(fh, reply));
    }
}

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;
