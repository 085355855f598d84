// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Runtime configuration of the filtered mount.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Config as ConfigBase, Environment, File, FileFormat};
use serde::Deserialize;

use crate::{AgeWindow, ListingErrors, Passthrough, Result, ShowAll, Visibility};

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

static SYSTEM_CONFIG: &str = "/etc/recentfs.toml";
static USER_CONFIG: &str = "recentfs/recentfs.toml";

/// The visibility policy to mount with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Only show entries that changed within the configured window.
    #[default]
    Age,
    /// Show every entry.
    All,
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "age" => Ok(Self::Age),
            "all" => Ok(Self::All),
            other => Err(format!(
                "invalid policy '{other}', expected 'age' or 'all'"
            )),
        }
    }
}

/// Settings that control which entries are visible.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Filter {
    /// The visibility policy to apply.
    pub policy: PolicyKind,
    /// The age, in days, past which entries are hidden by the age policy.
    pub max_age_days: u64,
    /// How a failed visibility check affects a directory listing.
    pub listing_errors: ListingErrors,
    /// Also hide filtered entries from lookups by name.
    pub strict_lookup: bool,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            max_age_days: 14,
            listing_errors: ListingErrors::default(),
            strict_lookup: false,
        }
    }
}

impl Filter {
    /// Construct the configured visibility policy.
    pub fn build_policy(&self) -> Box<dyn Visibility> {
        match self.policy {
            PolicyKind::Age => Box::new(AgeWindow::days(self.max_age_days)),
            PolicyKind::All => Box::new(ShowAll),
        }
    }
}

/// Settings for establishing the mount.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Mount {
    /// Additional fuse mount options, in the form `opt` or `opt=value`.
    pub options: Vec<String>,
    /// Allow users other than the one mounting to access the mount.
    pub allow_other: bool,
}

/// The complete configuration of a mount.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which entries are visible
    pub filter: Filter,
    /// How the filesystem is mounted
    pub mount: Mount,
}

impl Config {
    /// Parse a configuration from a toml string.
    pub fn load_string<S: AsRef<str>>(conf: S) -> Result<Self> {
        let config = ConfigBase::builder()
            .add_source(File::from_str(conf.as_ref(), FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Construct the driver for a backing directory, as configured.
    pub fn passthrough(&self, root: impl Into<PathBuf>) -> Passthrough<Box<dyn Visibility>> {
        Passthrough::new(root, self.filter.build_policy())
            .with_listing_errors(self.filter.listing_errors)
            .with_strict_lookup(self.filter.strict_lookup)
    }
}

/// Load the configuration from disk and the environment.
///
/// This includes the system and user configuration files, if they
/// exist, followed by any `RECENTFS_` environment variables
/// (eg: `RECENTFS_FILTER__MAX_AGE_DAYS=7`).
pub fn load_config() -> Result<Config> {
    let mut files = vec![PathBuf::from(SYSTEM_CONFIG)];
    if let Some(dir) = dirs::config_dir() {
        files.push(dir.join(USER_CONFIG));
    }
    load_config_from(&files)
}

/// Load the configuration from the given files, in order of precedence
/// from lowest to highest, and then the environment.
///
/// Files that do not exist are skipped.
pub fn load_config_from<P: AsRef<Path>>(files: &[P]) -> Result<Config> {
    let mut builder = ConfigBase::builder();
    for file in files {
        tracing::trace!(path = ?file.as_ref(), "loading config file");
        builder = builder.add_source(
            File::from(file.as_ref())
                .format(FileFormat::Toml)
                .required(false),
        );
    }
    builder = builder.add_source(
        Environment::with_prefix("RECENTFS")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("mount.options"),
    );
    Ok(builder.build()?.try_deserialize()?)
}
