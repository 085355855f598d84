// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::OsString;
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use nix::fcntl::OFlag;
use nix::sys::stat::{Mode, UtimensatFlags};
use nix::sys::time::TimeSpec;
use serde::Deserialize;

use crate::policy::system_time;
use crate::{Error, Resolver, Result, Visibility};

#[cfg(test)]
#[path = "./passthrough_test.rs"]
mod passthrough_test;

/// What to do when the visibility of a single child cannot be
/// determined while listing a directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingErrors {
    /// Log the failure and leave the child out of the listing.
    #[default]
    Skip,
    /// Fail the whole listing with the child's error.
    Abort,
}

impl FromStr for ListingErrors {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            other => Err(format!(
                "invalid listing error mode '{other}', expected 'skip' or 'abort'"
            )),
        }
    }
}

/// The attributes of a backing entry, as reported to the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Attributes {
    pub atime: SystemTime,
    pub ctime: SystemTime,
    pub mtime: SystemTime,
    pub gid: u32,
    /// File type and permission bits
    pub mode: u32,
    pub nlink: u64,
    pub size: u64,
    pub uid: u32,
}

impl Attributes {
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            atime: system_time(meta.atime(), meta.atime_nsec()),
            ctime: system_time(meta.ctime(), meta.ctime_nsec()),
            mtime: system_time(meta.mtime(), meta.mtime_nsec()),
            gid: meta.gid(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            size: meta.size(),
            uid: meta.uid(),
        }
    }
}

/// Statistics of the filesystem that holds the backing directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FsStats {
    pub blocks_available: u64,
    pub blocks_free: u64,
    pub blocks: u64,
    pub block_size: u64,
    pub files_available: u64,
    pub files_free: u64,
    pub files: u64,
    /// Mount flags of the underlying filesystem (`ST_*`)
    pub flags: u64,
    pub fragment_size: u64,
    pub name_max: u64,
}

impl From<nix::sys::statvfs::Statvfs> for FsStats {
    // the field types of statvfs differ between platforms
    #[allow(clippy::useless_conversion)]
    fn from(stat: nix::sys::statvfs::Statvfs) -> Self {
        Self {
            blocks_available: u64::from(stat.blocks_available()),
            blocks_free: u64::from(stat.blocks_free()),
            blocks: u64::from(stat.blocks()),
            block_size: u64::from(stat.block_size()),
            files_available: u64::from(stat.files_available()),
            files_free: u64::from(stat.files_free()),
            files: u64::from(stat.files()),
            flags: u64::from(stat.flags().bits()),
            fragment_size: u64::from(stat.fragment_size()),
            name_max: u64::from(stat.name_max()),
        }
    }
}

/// An open file, as returned by [`Passthrough::open`].
///
/// This is the operating system's file descriptor and is
/// only valid until it is given to [`Passthrough::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(RawFd);

impl Handle {
    /// Recover a handle from the number given to the kernel.
    pub fn from_fh(fh: u64) -> Result<Self> {
        match RawFd::try_from(fh) {
            Ok(fd) if fd >= 0 => Ok(Self(fd)),
            _ => Err(Error::BadHandle(fh)),
        }
    }

    /// The number that identifies this handle to the kernel.
    pub fn fh(&self) -> u64 {
        self.0 as u64
    }

    /// View the open descriptor as a file without taking ownership of it.
    fn borrow_file(&self) -> ManuallyDrop<std::fs::File> {
        // Safety: the descriptor remains open until it is released, and the
        // file is never dropped so that it does not close the descriptor
        ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(self.0) })
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// A new value for one of the timestamps of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    /// Use the current time
    Now,
    /// Use a specific time
    At(SystemTime),
    /// Leave the timestamp unchanged
    Omit,
}

impl Timestamp {
    fn to_timespec(self) -> TimeSpec {
        match self {
            Self::Now => TimeSpec::UTIME_NOW,
            Self::Omit => TimeSpec::UTIME_OMIT,
            Self::At(time) => match time.duration_since(SystemTime::UNIX_EPOCH) {
                Ok(since) => TimeSpec::from(since),
                Err(err) => {
                    let before = err.duration();
                    let mut secs = -(before.as_secs() as i64);
                    let mut nanos = -i64::from(before.subsec_nanos());
                    if nanos < 0 {
                        secs -= 1;
                        nanos += 1_000_000_000;
                    }
                    TimeSpec::new(secs as _, nanos as _)
                }
            },
        }
    }
}

/// A read-only passthrough of a backing directory, filtered
/// by a visibility policy.
///
/// Every operation takes a path as seen through the mount and performs
/// the matching operation on the backing directory. The policy is
/// consulted whenever a directory is listed and whenever a file is
/// opened. Other operations, notably [`Passthrough::getattr`], work on
/// hidden entries too, so a hidden entry can still be inspected by
/// anyone that already knows its name (see [`Passthrough::with_strict_lookup`]).
#[derive(Debug)]
pub struct Passthrough<V> {
    resolver: Resolver,
    policy: V,
    listing_errors: ListingErrors,
    strict_lookup: bool,
}

impl<V: Visibility> Passthrough<V> {
    /// Mirror the given backing directory, filtered by `policy`.
    pub fn new(root: impl Into<PathBuf>, policy: V) -> Self {
        Self {
            resolver: Resolver::new(root),
            policy,
            listing_errors: ListingErrors::default(),
            strict_lookup: false,
        }
    }

    /// Set how a failed visibility check affects a directory listing.
    pub fn with_listing_errors(mut self, listing_errors: ListingErrors) -> Self {
        self.listing_errors = listing_errors;
        self
    }

    /// Also apply the visibility policy to attribute lookups.
    ///
    /// When enabled, hidden entries cannot be inspected by name either,
    /// closing the gap between what is listed and what can be found.
    pub fn with_strict_lookup(mut self, strict_lookup: bool) -> Self {
        self.strict_lookup = strict_lookup;
        self
    }

    /// The backing directory being mirrored.
    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    /// The policy that filters this mirror.
    pub fn policy(&self) -> &V {
        &self.policy
    }

    /// The real location of a path within the mount.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.resolver.resolve(path)
    }

    fn check_visible(&self, full_path: &Path) -> Result<()> {
        if self.policy.is_visible(full_path)? {
            Ok(())
        } else {
            Err(Error::Hidden(full_path.to_owned()))
        }
    }

    /// Get the attributes of an entry, without following symbolic links.
    pub fn getattr(&self, path: &Path) -> Result<Attributes> {
        let full_path = self.resolve(path);
        let meta = std::fs::symlink_metadata(&full_path)?;
        // the root of the mount must always remain reachable
        if self.strict_lookup && full_path != self.root() {
            self.check_visible(&full_path)?;
        }
        Ok(Attributes::from_metadata(&meta))
    }

    /// List the names in a directory.
    ///
    /// The `.` and `..` entries always come first, followed by each
    /// child that the visibility policy allows. Listing a path that
    /// is not a directory yields only the dot entries.
    pub fn readdir(&self, path: &Path) -> Result<ReadDir<'_, V>> {
        let full_path = self.resolve(path);
        let entries = if full_path.is_dir() {
            Some(std::fs::read_dir(&full_path)?)
        } else {
            None
        };
        tracing::trace!(?path, is_dir = entries.is_some(), "readdir");
        Ok(ReadDir {
            driver: self,
            dots: [".", ".."].iter(),
            entries,
        })
    }

    /// Read the target of a symbolic link.
    ///
    /// Absolute targets are rewritten relative to the backing root so
    /// that they remain meaningful within the mount.
    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let target = std::fs::read_link(self.resolve(path))?;
        if target.is_absolute() {
            Ok(self.resolver.relative_to_root(&target))
        } else {
            Ok(target)
        }
    }

    /// Report the statistics of the filesystem holding an entry.
    pub fn statfs(&self, path: &Path) -> Result<FsStats> {
        let full_path = self.resolve(path);
        let stat = nix::sys::statvfs::statvfs(full_path.as_path())?;
        Ok(stat.into())
    }

    /// Update the access and modification times of an entry.
    ///
    /// When no times are given, both are set to the current time.
    pub fn utimens(&self, path: &Path, times: Option<(Timestamp, Timestamp)>) -> Result<()> {
        let full_path = self.resolve(path);
        let (atime, mtime) = times.unwrap_or((Timestamp::Now, Timestamp::Now));
        nix::sys::stat::utimensat(
            None,
            full_path.as_path(),
            &atime.to_timespec(),
            &mtime.to_timespec(),
            UtimensatFlags::FollowSymlink,
        )?;
        Ok(())
    }

    /// Open a visible file for reading.
    ///
    /// Entries that the policy hides cannot be opened and are reported
    /// as missing, as are entries that do not exist at all.
    pub fn open(&self, path: &Path, flags: OFlag) -> Result<Handle> {
        if flags & OFlag::O_ACCMODE != OFlag::O_RDONLY
            || flags.intersects(OFlag::O_CREAT | OFlag::O_TRUNC)
        {
            tracing::debug!("open {path:?} [{flags:?}] = EROFS");
            return Err(Error::ReadOnly);
        }
        let full_path = self.resolve(path);
        if let Err(err) = self.check_visible(&full_path) {
            tracing::debug!("open {path:?} = {err}");
            return Err(err);
        }
        let fd = nix::fcntl::open(full_path.as_path(), flags, Mode::empty())?;
        tracing::trace!("open {path:?} = {fd}");
        Ok(Handle(fd))
    }

    /// Read up to `size` bytes from an open file, starting at `offset`.
    ///
    /// Fewer bytes are returned only when the end of the file is reached.
    pub fn read(&self, path: &Path, handle: Handle, size: usize, offset: u64) -> Result<Vec<u8>> {
        let file = handle.borrow_file();
        let mut buf = vec![0; size];
        let mut consumed = 0;
        while consumed < size {
            match file.read_at(&mut buf[consumed..], offset + consumed as u64) {
                // the end of the file has been reached
                Ok(0) => break,
                Ok(count) => consumed += count,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        buf.truncate(consumed);
        tracing::trace!("read {path:?} [{}] = {consumed}/{size}", handle.0);
        Ok(buf)
    }

    /// Force any data of an open file out to durable storage.
    pub fn flush(&self, path: &Path, handle: Handle) -> Result<()> {
        tracing::trace!("flush {path:?} [{}]", handle.0);
        handle.borrow_file().sync_all()?;
        Ok(())
    }

    /// Close an open file.
    pub fn release(&self, path: &Path, handle: Handle) -> Result<()> {
        tracing::trace!("release {path:?} [{}]", handle.0);
        nix::unistd::close(handle.as_raw_fd())?;
        Ok(())
    }
}

/// The names in a directory of the mount, see [`Passthrough::readdir`].
///
/// Each child is checked against the visibility policy as it is reached,
/// so the listing reflects the backing directory at the time it is read.
pub struct ReadDir<'a, V> {
    driver: &'a Passthrough<V>,
    dots: std::slice::Iter<'static, &'static str>,
    entries: Option<std::fs::ReadDir>,
}

impl<V: Visibility> Iterator for ReadDir<'_, V> {
    type Item = Result<OsString>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(dot) = self.dots.next() {
            return Some(Ok(OsString::from(dot)));
        }
        loop {
            let entry = match self.entries.as_mut()?.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    self.entries = None;
                    return Some(Err(err.into()));
                }
            };
            let path = entry.path();
            match self.driver.policy.is_visible(&path) {
                Ok(true) => return Some(Ok(entry.file_name())),
                Ok(false) => {
                    tracing::trace!(?path, "readdir hide");
                }
                Err(err) => match self.driver.listing_errors {
                    ListingErrors::Skip => {
                        tracing::warn!(?path, "Skipping entry that could not be checked: {err}");
                    }
                    ListingErrors::Abort => {
                        self.entries = None;
                        return Some(Err(err));
                    }
                },
            }
        }
    }
}
