// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

#[cfg(test)]
#[path = "./args_test.rs"]
mod args_test;

const RECENTFS_LOG: &str = "RECENTFS_LOG";

/// Command line flags for configuring logging output
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Logging {
    /// Make output more verbose, can be specified more than once
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also write all logs to this file
    #[clap(long, global = true, env = "RECENTFS_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Logging {
    /// Install the global logger as described by these flags
    pub fn configure(&self) -> Result<()> {
        configure_logging(self.verbose as usize, self.log_file.as_deref())
    }
}

/// The filter directives for a verbosity level.
///
/// With no added verbosity, an existing `RECENTFS_LOG` value replaces
/// the default. `RUST_LOG` is always appended so that individual targets
/// can be adjusted when debugging.
pub fn log_directives(
    verbosity: usize,
    recentfs_log: Option<String>,
    rust_log: Option<String>,
) -> String {
    let mut directives = match verbosity {
        0 => recentfs_log.unwrap_or_else(|| "recentfs=info,warn".to_string()),
        1 => "recentfs=debug,info".to_string(),
        2 => "recentfs=trace,info".to_string(),
        3 => "recentfs=trace,debug".to_string(),
        _ => "trace".to_string(),
    };
    if let Some(overrides) = rust_log.filter(|o| !o.is_empty()) {
        directives.push(',');
        directives.push_str(&overrides);
    }
    directives
}

/// Install the global logger, writing to stderr and optionally to a file
pub fn configure_logging(verbosity: usize, log_file: Option<&Path>) -> Result<()> {
    let directives = log_directives(
        verbosity,
        std::env::var(RECENTFS_LOG).ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let env_filter = tracing_subscriber::filter::EnvFilter::new(directives);
    let stderr_log = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(verbosity > 2)
        .with_writer(std::io::stderr);

    let file_log = match log_file {
        None => None,
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
    };

    let sub = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_log)
        .with(file_log);
    tracing::subscriber::set_global_default(sub).context("Failed to set default logger")
}

/// Turn the result of a command into a process exit code,
/// logging the error if there was one.
#[macro_export]
macro_rules! handle_result {
    ($result:ident) => {{
        match $result {
            Err(err) => {
                $crate::__private::tracing::error!("{err:#}");
                1
            }
            Ok(code) => code,
        }
    }};
}
