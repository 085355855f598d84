// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fuser::MountOption;
use recentfs::config::PolicyKind;
use recentfs::{Config, ListingErrors, Session};
use recentfs_cli_common as cli;
use tokio::signal::unix::{SignalKind, signal};

#[cfg(test)]
#[path = "./cmd_mount_test.rs"]
mod cmd_mount_test;

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}

fn main2() -> i32 {
    let opt = CmdMount::parse();
    if let Err(err) = opt.logging.configure() {
        eprintln!("{err:#}");
        return 1;
    }

    let config = match recentfs::load_config() {
        Err(err) => {
            tracing::error!(err = ?err, "failed to load config");
            return 1;
        }
        Ok(config) => config,
    };
    let result = opt.run(&config);

    cli::handle_result!(result)
}

/// Mount a read-only view of a directory that only shows recent entries
#[derive(Debug, Parser)]
#[clap(name = "recentfs", version = recentfs::VERSION)]
pub struct CmdMount {
    #[clap(flatten)]
    logging: cli::Logging,

    /// The visibility policy, either 'age' or 'all' [default: from config]
    #[clap(long)]
    policy: Option<PolicyKind>,

    /// Hide entries whose change time is this many days old or more
    #[clap(long)]
    max_age_days: Option<u64>,

    /// What to do when an entry cannot be checked while listing,
    /// either 'skip' or 'abort'
    #[clap(long)]
    listing_errors: Option<ListingErrors>,

    /// Also hide filtered entries when they are looked up by name
    #[clap(long)]
    strict_lookup: bool,

    /// Options for the mount in the form opt1,opt2=value
    ///
    /// These are passed on to fuse, except for 'rw' which is refused.
    #[clap(long, short, value_delimiter = ',')]
    options: Vec<String>,

    /// The directory to mirror
    #[clap(name = "BACKING_ROOT")]
    backing_root: PathBuf,

    /// The location where to mount the filtered view
    #[clap(name = "MOUNTPOINT")]
    mountpoint: PathBuf,
}

impl CmdMount {
    pub fn run(&self, config: &Config) -> Result<i32> {
        let mut config = config.clone();
        self.apply_overrides(&mut config);
        tracing::debug!("Config: {config:#?}");

        let backing_root = self
            .backing_root
            .canonicalize()
            .context("Invalid backing directory")?;
        if !backing_root.is_dir() {
            bail!("Backing root is not a directory: {}", backing_root.display());
        }
        let mountpoint = self
            .mountpoint
            .canonicalize()
            .context("Invalid mount point")?;
        if mountpoint.starts_with(&backing_root) {
            bail!(
                "Mount point {} cannot be inside the backing directory",
                mountpoint.display()
            );
        }

        let mount_opts = mount_options(&config, &self.options)?;
        tracing::debug!("Mount options: {mount_opts:?}");

        tracing::debug!("Establishing fuse session...");
        let mut session = fuser::Session::new(
            Session::new(config.passthrough(&backing_root)),
            &mountpoint,
            &mount_opts,
        )
        .context("Failed to create a FUSE session")?;
        let mut unmounter = session.unmount_callable();

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to establish runtime")?;

        let result = rt.block_on(async move {
            let mut interrupt = signal(SignalKind::interrupt()).context("interrupt signal handler")?;
            let mut quit = signal(SignalKind::quit()).context("quit signal handler")?;
            let mut terminate = signal(SignalKind::terminate()).context("terminate signal handler")?;

            tracing::info!(
                root = %backing_root.display(),
                mountpoint = %mountpoint.display(),
                "Starting FUSE filesystem"
            );
            // the session blocks while serving requests, and each request
            // is itself handed to the blocking pool of this runtime
            let mut fut = tokio::task::spawn_blocking(move || session.run());
            let received = tokio::select! {
                res = &mut fut => {
                    tracing::info!("Filesystem was unmounted");
                    return res.context("FUSE session panicked")?.context("FUSE session failed");
                }
                _ = terminate.recv() => "Terminate",
                _ = interrupt.recv() => "Interrupt",
                _ = quit.recv() => "Quit",
            };

            tracing::info!("{received} signal received, filesystem shutting down");
            unmounter.unmount().context("Failed to unmount filesystem")?;
            fut.await
                .context("FUSE session panicked")?
                .context("FUSE session failed")
        });

        // any request still running on the blocking pool is
        // given a moment to finish before the runtime goes away
        rt.shutdown_timeout(std::time::Duration::from_secs(2));
        result?;
        Ok(0)
    }

    /// Layer the command line flags over the loaded configuration
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(policy) = self.policy {
            config.filter.policy = policy;
        }
        if let Some(days) = self.max_age_days {
            config.filter.max_age_days = days;
        }
        if let Some(mode) = self.listing_errors {
            config.filter.listing_errors = mode;
        }
        if self.strict_lookup {
            config.filter.strict_lookup = true;
        }
    }
}

/// The complete set of options to mount with.
///
/// The configured options come first, then the ones given on the
/// command line, all on top of the options that every mount requires.
fn mount_options(config: &Config, args: &[String]) -> Result<Vec<MountOption>> {
    let mut opts = vec![
        MountOption::NoDev,
        MountOption::NoSuid,
        MountOption::FSName("recentfs".into()),
    ];
    if config.mount.allow_other {
        opts.push(MountOption::AllowOther);
    }

    let requested = config.mount.options.iter().chain(args.iter());
    for option in parse_options_from_args(requested) {
        match option {
            MountOption::RW => bail!("rw mode is not supported"),
            MountOption::Dev | MountOption::Suid => {
                bail!("device files and setuid bits are never honored: {option:?}")
            }
            MountOption::FSName(_) => {
                opts.retain(|o| !matches!(o, MountOption::FSName(_)));
                opts.push(option);
            }
            _ if opts.contains(&option) => {}
            _ => opts.push(option),
        }
    }
    Ok(opts)
}

/// Copies from the private [`fuser::MountOption::from_str`]
fn parse_options_from_args<'a>(args: impl IntoIterator<Item = &'a String>) -> Vec<MountOption> {
    args.into_iter()
        .map(|s| match s.as_str() {
            "auto_unmount" => MountOption::AutoUnmount,
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "default_permissions" => MountOption::DefaultPermissions,
            "dev" => MountOption::Dev,
            "nodev" => MountOption::NoDev,
            "suid" => MountOption::Suid,
            "nosuid" => MountOption::NoSuid,
            "ro" => MountOption::RO,
            "rw" => MountOption::RW,
            "exec" => MountOption::Exec,
            "noexec" => MountOption::NoExec,
            "atime" => MountOption::Atime,
            "noatime" => MountOption::NoAtime,
            "dirsync" => MountOption::DirSync,
            "sync" => MountOption::Sync,
            "async" => MountOption::Async,
            x if x.starts_with("fsname=") => MountOption::FSName(x[7..].into()),
            x if x.starts_with("subtype=") => MountOption::Subtype(x[8..].into()),
            x => MountOption::CUSTOM(x.into()),
        })
        .collect()
}
