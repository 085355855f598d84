// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::OsStr;

use clap::Parser;
use fuser::MountOption;
use recentfs::config::PolicyKind;
use recentfs::{Config, ListingErrors};
use rstest::rstest;

use super::{CmdMount, mount_options, parse_options_from_args};

#[rstest]
fn test_parse_positional_order() {
    let cmd = CmdMount::try_parse_from(["recentfs", "/data", "/mnt/recent"]).unwrap();
    assert_eq!(cmd.backing_root, std::path::Path::new("/data"));
    assert_eq!(cmd.mountpoint, std::path::Path::new("/mnt/recent"));
    assert!(cmd.options.is_empty());
    assert!(cmd.policy.is_none());
}

#[rstest]
fn test_parse_requires_mountpoint() {
    CmdMount::try_parse_from(["recentfs", "/data"])
        .expect_err("a mount point must be given");
}

#[rstest]
fn test_overrides_replace_config() {
    let cmd = CmdMount::try_parse_from([
        "recentfs",
        "--policy",
        "all",
        "--max-age-days",
        "3",
        "--listing-errors",
        "abort",
        "--strict-lookup",
        "-o",
        "noatime,allow_root",
        "/data",
        "/mnt",
    ])
    .unwrap();
    assert_eq!(cmd.options, vec!["noatime", "allow_root"]);

    let mut config = Config::default();
    cmd.apply_overrides(&mut config);
    assert_eq!(config.filter.policy, PolicyKind::All);
    assert_eq!(config.filter.max_age_days, 3);
    assert_eq!(config.filter.listing_errors, ListingErrors::Abort);
    assert!(config.filter.strict_lookup);
}

#[rstest]
fn test_no_overrides_keep_config() {
    let cmd = CmdMount::try_parse_from(["recentfs", "/data", "/mnt"]).unwrap();
    let mut config = Config::default();
    config.filter.max_age_days = 30;
    config.filter.strict_lookup = true;
    cmd.apply_overrides(&mut config);
    assert_eq!(config.filter.max_age_days, 30);
    assert!(config.filter.strict_lookup);
    assert_eq!(config.filter.policy, PolicyKind::Age);
}

#[rstest]
fn test_parse_invalid_policy() {
    CmdMount::try_parse_from(["recentfs", "--policy", "newest", "/data", "/mnt"])
        .expect_err("unknown policies are rejected");
}

#[rstest]
fn test_parse_options_from_args() {
    let args = vec![
        "ro".to_string(),
        "fsname=mirror".to_string(),
        "subtype=recent".to_string(),
        "max_read=4096".to_string(),
    ];
    let parsed = parse_options_from_args(&args);
    assert_eq!(
        parsed,
        vec![
            MountOption::RO,
            MountOption::FSName("mirror".into()),
            MountOption::Subtype("recent".into()),
            MountOption::CUSTOM("max_read=4096".into()),
        ]
    );
}

#[rstest]
fn test_mount_options_defaults() {
    let opts = mount_options(&Config::default(), &[]).unwrap();
    assert_eq!(
        opts,
        vec![
            MountOption::NoDev,
            MountOption::NoSuid,
            MountOption::FSName("recentfs".into()),
        ]
    );
}

#[rstest]
fn test_mount_options_merged() {
    let mut config = Config::default();
    config.mount.allow_other = true;
    config.mount.options = vec!["noatime".into(), "nodev".into()];
    let opts = mount_options(&config, &["ro".to_string(), "noatime".to_string()]).unwrap();
    assert_eq!(
        opts,
        vec![
            MountOption::NoDev,
            MountOption::NoSuid,
            MountOption::FSName("recentfs".into()),
            MountOption::AllowOther,
            MountOption::NoAtime,
            MountOption::RO,
        ]
    );
}

#[rstest]
fn test_mount_options_fsname_replaced() {
    let opts = mount_options(&Config::default(), &["fsname=mirror".to_string()]).unwrap();
    let names: Vec<_> = opts
        .iter()
        .filter(|o| matches!(o, MountOption::FSName(_)))
        .collect();
    assert_eq!(names, vec![&MountOption::FSName("mirror".into())]);
}

#[rstest]
#[case("rw")]
#[case("dev")]
#[case("suid")]
fn test_mount_options_refused(#[case] option: &str) {
    mount_options(&Config::default(), &[option.to_string()])
        .expect_err("option should be refused");
}

#[rstest]
fn test_run_missing_backing_root() {
    let tmpdir = tempfile::tempdir().unwrap();
    let missing = tmpdir.path().join("missing");
    let mountpoint = tmpdir.path().join("mnt");
    std::fs::create_dir(&mountpoint).unwrap();
    let cmd = CmdMount::try_parse_from([
        OsStr::new("recentfs"),
        missing.as_os_str(),
        mountpoint.as_os_str(),
    ])
    .unwrap();
    let err = cmd.run(&Config::default()).unwrap_err();
    assert!(err.to_string().contains("Invalid backing directory"));
}

#[rstest]
fn test_run_backing_root_not_a_directory() {
    let tmpdir = tempfile::tempdir().unwrap();
    let file = tmpdir.path().join("file.txt");
    std::fs::write(&file, "data").unwrap();
    let mountpoint = tmpdir.path().join("mnt");
    std::fs::create_dir(&mountpoint).unwrap();
    let cmd = CmdMount::try_parse_from([
        OsStr::new("recentfs"),
        file.as_os_str(),
        mountpoint.as_os_str(),
    ])
    .unwrap();
    let err = cmd.run(&Config::default()).unwrap_err();
    assert!(err.to_string().contains("not a directory"));
}

#[rstest]
fn test_run_mountpoint_inside_backing_root() {
    let tmpdir = tempfile::tempdir().unwrap();
    let mountpoint = tmpdir.path().join("mnt");
    std::fs::create_dir(&mountpoint).unwrap();
    let cmd = CmdMount::try_parse_from([
        OsStr::new("recentfs"),
        tmpdir.path().as_os_str(),
        mountpoint.as_os_str(),
    ])
    .unwrap();
    let err = cmd.run(&Config::default()).unwrap_err();
    assert!(err.to_string().contains("cannot be inside"));
}

#[rstest]
fn test_run_refuses_rw() {
    let backing = tempfile::tempdir().unwrap();
    let mountpoint = tempfile::tempdir().unwrap();
    let cmd = CmdMount::try_parse_from([
        OsStr::new("recentfs"),
        OsStr::new("-o"),
        OsStr::new("rw"),
        backing.path().as_os_str(),
        mountpoint.path().as_os_str(),
    ])
    .unwrap();
    let err = cmd.run(&Config::default()).unwrap_err();
    assert!(err.to_string().contains("rw mode"));
}
