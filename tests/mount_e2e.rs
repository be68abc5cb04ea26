#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::fs;
use std::os::unix::fs::MetadataExt as _;
use std::sync::Arc;
use std::thread;

use pagesfs::{GitFs, GitFsConfig};

/// End-to-end smoke test through the kernel. Needs `/dev/fuse`, so it is
/// opt-in: `cargo test -- --ignored`.
#[test]
#[ignore = "requires /dev/fuse"]
fn serves_the_fixture_over_a_kernel_mount() {
    let fixture = common::build_fixture();
    let gitfs = Arc::new(
        GitFs::new(GitFsConfig {
            repo_root: fixture.path().to_path_buf(),
            debug: false,
        })
        .unwrap(),
    );

    let serve_thread = {
        let gitfs = Arc::clone(&gitfs);
        thread::spawn(move || gitfs.start())
    };
    gitfs.wait_mounted();

    let mut users: Vec<String> = fs::read_dir(gitfs.mountpoint())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    users.sort();
    assert_eq!(users, ["flightjs", "pry", "remnux"]);

    let md = fs::metadata(gitfs.mountpoint().join("flightjs/example-app")).unwrap();
    assert!(md.is_dir());
    assert_eq!(md.nlink(), 5);
    assert_eq!(md.mode() & 0o222, 0);

    let data = fs::read(gitfs.mountpoint().join("pry/ruby-pry/bin/pry")).unwrap();
    assert_eq!(data, b"#!/usr/bin/env ruby\n");

    let err = fs::read_link(gitfs.mountpoint().join("pry/ruby-pry/Gemfile")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

    // Writes fail: the mount is read-only.
    assert!(fs::write(gitfs.mountpoint().join("pry/ruby-pry/new-file"), "x").is_err());

    gitfs.unmount().unwrap();
    serve_thread.join().unwrap();
    assert!(!gitfs.mountpoint().exists());
}
