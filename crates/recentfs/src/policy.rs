// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Policies that decide which backing entries are exposed by the mount.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::Result;

#[cfg(test)]
#[path = "./policy_test.rs"]
mod policy_test;

const MINUTE: u64 = 60;
const HOUR: u64 = MINUTE * 60;
const DAY: u64 = HOUR * 24;
const WEEK: u64 = DAY * 7;

/// Decides whether an entry of the backing directory shows up in the mount.
///
/// Policies are consulted with the resolved (real) path of the entry
/// whenever the mount lists a directory or opens a file. They may inspect
/// the filesystem but must not keep state between calls.
pub trait Visibility: Send + Sync {
    /// Should the entry at this backing path be visible through the mount?
    fn is_visible(&self, path: &Path) -> Result<bool>;
}

impl<T: Visibility + ?Sized> Visibility for std::sync::Arc<T> {
    fn is_visible(&self, path: &Path) -> Result<bool> {
        (**self).is_visible(path)
    }
}

impl<T: Visibility + ?Sized> Visibility for Box<T> {
    fn is_visible(&self, path: &Path) -> Result<bool> {
        (**self).is_visible(path)
    }
}

/// Exposes every entry, making the mount a plain read-only alias.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShowAll;

impl Visibility for ShowAll {
    fn is_visible(&self, _path: &Path) -> Result<bool> {
        Ok(true)
    }
}

/// The source of the current time for age based policies.
#[derive(Debug, Default, Clone, Copy)]
pub enum Clock {
    /// Read the system clock on every check.
    #[default]
    System,
    /// Evaluate every check against this fixed instant.
    Fixed(SystemTime),
}

impl Clock {
    /// The instant to compare entry timestamps against.
    pub fn now(&self) -> SystemTime {
        match self {
            Self::System => SystemTime::now(),
            Self::Fixed(instant) => *instant,
        }
    }
}

/// Only shows entries whose change time falls within a window of the present.
///
/// The change time is read without following symbolic links, so a link
/// is judged by its own age and not by that of its target.
#[derive(Debug, Clone)]
pub struct AgeWindow {
    window: Duration,
    clock: Clock,
}

impl AgeWindow {
    /// The default window: two weeks.
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(WEEK * 2);

    /// Show entries that changed less than `window` ago.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            clock: Clock::System,
        }
    }

    /// Show entries that changed less than the given number of days ago.
    pub fn days(days: u64) -> Self {
        Self::new(Duration::from_secs(DAY.saturating_mul(days)))
    }

    /// Evaluate entry ages against the given clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The maximum age of a visible entry.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether an entry that changed at `changed` is inside the window.
    ///
    /// Entries with a change time in the future are always visible.
    pub fn contains(&self, changed: SystemTime) -> bool {
        match self.clock.now().duration_since(changed) {
            Ok(age) => age < self.window,
            Err(_) => true,
        }
    }
}

impl Default for AgeWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

impl Visibility for AgeWindow {
    fn is_visible(&self, path: &Path) -> Result<bool> {
        let meta = std::fs::symlink_metadata(path)?;
        let changed = system_time(meta.ctime(), meta.ctime_nsec());
        let visible = self.contains(changed);
        tracing::trace!(?path, visible, "age check");
        Ok(visible)
    }
}

/// Convert a unix timestamp as reported by stat into a [`SystemTime`].
pub(crate) fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}
