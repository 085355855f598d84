// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rstest::rstest;

use super::{AgeWindow, Clock, DAY, ShowAll, Visibility, system_time};
use crate::fixtures::*;

fn ctime_of(path: &std::path::Path) -> SystemTime {
    let meta = std::fs::symlink_metadata(path).unwrap();
    system_time(meta.ctime(), meta.ctime_nsec())
}

#[rstest]
fn test_default_window_is_two_weeks() {
    assert_eq!(AgeWindow::default().window(), Duration::from_secs(14 * 24 * 3600));
    assert_eq!(AgeWindow::days(14).window(), AgeWindow::DEFAULT_WINDOW);
}

#[rstest]
#[case(0, true)]
#[case(DAY, true)]
#[case(13 * DAY, true)]
#[case(14 * DAY - 1, true)]
#[case(14 * DAY, false)]
#[case(20 * DAY, false)]
fn test_window_boundary(#[case] age_secs: u64, #[case] expected: bool) {
    let changed = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let now = changed + Duration::from_secs(age_secs);
    let policy = AgeWindow::default().with_clock(Clock::Fixed(now));
    assert_eq!(policy.contains(changed), expected);
}

#[rstest]
fn test_future_change_time_is_visible() {
    let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let policy = AgeWindow::default().with_clock(Clock::Fixed(now));
    assert!(policy.contains(now + Duration::from_secs(3600)));
}

#[rstest]
fn test_fresh_file_is_visible(tmpdir: tempfile::TempDir) {
    init_logging();
    write_file(tmpdir.path(), "new.txt", b"fresh");
    let policy = AgeWindow::default();
    assert!(policy.is_visible(&tmpdir.path().join("new.txt")).unwrap());
}

#[rstest]
fn test_old_file_is_hidden(tmpdir: tempfile::TempDir) {
    write_file(tmpdir.path(), "old.txt", b"stale");
    let path = tmpdir.path().join("old.txt");
    let later = ctime_of(&path) + Duration::from_secs(20 * DAY);
    let policy = AgeWindow::default().with_clock(Clock::Fixed(later));
    assert!(!policy.is_visible(&path).unwrap());
}

#[rstest]
fn test_symlink_judged_by_itself(tmpdir: tempfile::TempDir) {
    let root = tmpdir.path();
    std::os::unix::fs::symlink("/does/not/exist", root.join("dangling")).unwrap();
    let policy = AgeWindow::default();
    assert!(
        policy.is_visible(&root.join("dangling")).unwrap(),
        "a dangling link should be judged by its own change time"
    );
}

#[rstest]
fn test_missing_path_is_an_error(tmpdir: tempfile::TempDir) {
    let policy = AgeWindow::default();
    let err = policy
        .is_visible(&tmpdir.path().join("missing"))
        .expect_err("should fail to check a missing file");
    assert_eq!(crate::OsError::os_error(&err), Some(libc::ENOENT));
}

#[rstest]
fn test_show_all(tmpdir: tempfile::TempDir) {
    assert!(ShowAll.is_visible(tmpdir.path()).unwrap());
    assert!(ShowAll.is_visible(&tmpdir.path().join("missing")).unwrap());
}

#[rstest]
fn test_shared_policy(tmpdir: tempfile::TempDir) {
    let policy: Arc<dyn Visibility> = Arc::new(ShowAll);
    assert!(policy.is_visible(tmpdir.path()).unwrap());
    let boxed: Box<dyn Visibility> = Box::new(AgeWindow::default());
    assert!(boxed.is_visible(tmpdir.path()).unwrap());
}

#[rstest]
#[case(0, 0, 0)]
#[case(1_700_000_000, 500, 1_700_000_000_000_000_500)]
fn test_system_time(#[case] secs: i64, #[case] nsecs: i64, #[case] expected_nanos: u128) {
    let time = system_time(secs, nsecs);
    assert_eq!(
        time.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_nanos(),
        expected_nanos
    );
}

#[rstest]
fn test_system_time_before_epoch() {
    let time = system_time(-10, 0);
    assert_eq!(
        SystemTime::UNIX_EPOCH.duration_since(time).unwrap(),
        Duration::from_secs(10)
    );
}
