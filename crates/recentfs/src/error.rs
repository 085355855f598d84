// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the filtered passthrough filesystem.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying filesystem call failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An underlying system call failed.
    #[error(transparent)]
    Nix(#[from] nix::errno::Errno),

    /// The entry exists but is rejected by the visibility policy.
    #[error("Entry is hidden by the visibility policy: {0}")]
    Hidden(PathBuf),

    /// A mutating operation was requested on the read-only mount.
    #[error("Filesystem is read-only")]
    ReadOnly,

    /// A file handle was given that cannot refer to an open file.
    #[error("Invalid file handle: {0}")]
    BadHandle(u64),

    /// The configuration could not be loaded.
    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    /// A request named an inode that is not known to the mount.
    #[error("Unknown inode: {0}")]
    UnknownInode(u64),
}

/// The result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can be reported to the kernel as an errno value.
pub trait OsError {
    /// The errno that best describes this error, if any.
    fn os_error(&self) -> Option<i32>;
}

impl OsError for Error {
    fn os_error(&self) -> Option<i32> {
        match self {
            Error::Io(err) => err.os_error(),
            Error::Nix(errno) => Some(*errno as i32),
            Error::Hidden(_) => Some(libc::ENOENT),
            Error::ReadOnly => Some(libc::EROFS),
            Error::BadHandle(_) => Some(libc::EBADF),
            Error::UnknownInode(_) => Some(libc::ENOENT),
            Error::Config(_) => None,
        }
    }
}

impl OsError for std::io::Error {
    fn os_error(&self) -> Option<i32> {
        match self.raw_os_error() {
            Some(errno) => Some(errno),
            None => match self.kind() {
                std::io::ErrorKind::NotFound => Some(libc::ENOENT),
                std::io::ErrorKind::PermissionDenied => Some(libc::EACCES),
                std::io::ErrorKind::UnexpectedEof => Some(libc::EIO),
                _ => None,
            },
        }
    }
}
