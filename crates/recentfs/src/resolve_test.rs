// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};

use rstest::rstest;

use super::Resolver;

#[rstest]
#[case("/", "/data")]
#[case("", "/data")]
#[case("/file.txt", "/data/file.txt")]
#[case("file.txt", "/data/file.txt")]
#[case("/nested/dir/file", "/data/nested/dir/file")]
#[case("/../escape", "/data/../escape")]
fn test_resolve(#[case] virtual_path: &str, #[case] expected: &str) {
    let resolver = Resolver::new("/data");
    assert_eq!(resolver.resolve(virtual_path), PathBuf::from(expected));
}

#[rstest]
fn test_resolve_repeated_separators() {
    let resolver = Resolver::new("/data");
    // repeated separators collapse into a single root component
    assert_eq!(resolver.resolve("//etc"), PathBuf::from("/data/etc"));
}

#[rstest]
#[case("/data/file.txt", "file.txt")]
#[case("/data/a/b/c", "a/b/c")]
#[case("/data", ".")]
#[case("/data/", ".")]
#[case("/elsewhere/file", "../elsewhere/file")]
#[case("/", "..")]
#[case("/data/gone/../target.txt", "target.txt")]
#[case("/data/./sub/./file", "sub/file")]
#[case("/data/../data/file", "file")]
#[case("/data/../../../file", "../file")]
fn test_relative_to_root(#[case] absolute: &str, #[case] expected: &str) {
    let resolver = Resolver::new("/data");
    assert_eq!(
        resolver.relative_to_root(Path::new(absolute)),
        PathBuf::from(expected)
    );
}

#[rstest]
fn test_relative_to_nested_root() {
    let resolver = Resolver::new("/srv/share/data");
    assert_eq!(
        resolver.relative_to_root(Path::new("/srv/other/file")),
        PathBuf::from("../../other/file")
    );
}

#[rstest]
fn test_relative_to_unnormalized_root() {
    let resolver = Resolver::new("/srv/./share/../data");
    assert_eq!(
        resolver.relative_to_root(Path::new("/srv/data/file")),
        PathBuf::from("file")
    );
}
