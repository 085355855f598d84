// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Component, Path, PathBuf};

#[cfg(test)]
#[path = "./resolve_test.rs"]
mod resolve_test;

/// Maps paths as seen through the mount onto the backing directory.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
}

impl Resolver {
    /// Create a resolver for the given backing root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The backing directory being mirrored.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join a virtual path onto the backing root.
    ///
    /// A single leading separator is stripped so that the virtual
    /// path is always joined relative to the root. No other
    /// normalization takes place, `..` segments are kept as-is.
    pub fn resolve(&self, virtual_path: impl AsRef<Path>) -> PathBuf {
        let virtual_path = virtual_path.as_ref();
        let partial = virtual_path.strip_prefix("/").unwrap_or(virtual_path);
        self.root.join(partial)
    }

    /// Express an absolute path in terms of the backing root.
    ///
    /// Both paths are normalized lexically first, without consulting
    /// the filesystem. Paths outside of the root climb out with `..`
    /// components, and the root itself becomes `.`.
    pub fn relative_to_root(&self, path: &Path) -> PathBuf {
        let root = normalize(&self.root);
        let path = normalize(path);
        let mut ours = root.components().peekable();
        let mut theirs = path.components().peekable();
        while let (Some(a), Some(b)) = (ours.peek(), theirs.peek()) {
            if a != b {
                break;
            }
            ours.next();
            theirs.next();
        }
        let mut relative: PathBuf = ours
            .filter(|c| !matches!(c, Component::CurDir))
            .map(|_| Component::ParentDir)
            .collect();
        relative.extend(theirs);
        if relative.as_os_str().is_empty() {
            relative.push(Component::CurDir);
        }
        relative
    }
}

/// Remove `.` components and fold each `..` into the component before it.
///
/// A `..` directly below the root stays at the root, and leading `..`
/// components of a relative path are kept.
fn normalize(path: &Path) -> PathBuf {
    let mut normal = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normal.last() {
                Some(Component::Normal(_)) => {
                    normal.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => normal.push(component),
            },
            _ => normal.push(component),
        }
    }
    normal.into_iter().collect()
}
