// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! A read-only mirror of a directory tree that hides entries
//! failing a visibility policy.
//!
//! The [`Passthrough`] driver resolves every virtual path against a
//! backing root and performs the real I/O there, while the bound
//! [`Visibility`] policy decides which entries show up in listings
//! and which can be opened. With the `fuse-backend` feature the driver
//! can be served to the kernel through a FUSE [`Session`].

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod fixtures;

pub mod config;
mod error;
#[cfg(all(unix, feature = "fuse-backend"))]
mod fuse;
mod passthrough;
pub mod policy;
mod resolve;

pub use config::{Config, load_config};
pub use error::{Error, OsError, Result};
#[cfg(all(unix, feature = "fuse-backend"))]
pub use fuse::Session;
pub use passthrough::{Attributes, FsStats, Handle, ListingErrors, Passthrough, ReadDir, Timestamp};
pub use policy::{AgeWindow, Clock, ShowAll, Visibility};
pub use resolve::Resolver;
