//! Shared fixture: a repository root with three users and five bare
//! repositories whose `master` trees have known entry sets, modes and
//! subtree counts.

#![allow(dead_code)]

use std::path::Path;

use git2::{Oid, Repository, Signature};
use tempfile::TempDir;

pub const MODE_DIR: i32 = 0o040_000;
pub const MODE_FILE: i32 = 0o100_644;
pub const MODE_EXEC: i32 = 0o100_755;
pub const MODE_LINK: i32 = 0o120_000;

pub struct Fixture {
    pub root: TempDir,
}

impl Fixture {
    pub fn path(&self) -> &Path {
        self.root.path()
    }
}

/// Lay out the fixture tree:
///
/// ```text
/// flightjs/example-app.git   12 root entries, 3 subtrees
/// flightjs/flightjs.git      3 subtrees, css/ holds two files
/// pry/pry.git                5 subtrees
/// pry/ruby-pry.git           3 subtrees, bin/pry is executable
/// remnux/remnux.git          3 subtrees
/// ```
///
/// plus a few non-repository distractors that listings must filter out.
pub fn build_fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();

    make_repo(root.path(), "flightjs", "example-app", |repo| {
        let app = subdir(repo, &[("boot.js", b"require(['app']);\n", MODE_FILE)]);
        let bower = subdir(repo, &[("flight.js", b"// flight\n", MODE_FILE)]);
        let test = subdir(repo, &[("spec.js", b"describe();\n", MODE_FILE)]);
        tree(
            repo,
            &[
                (".gitattributes", blob(repo, b"* text=auto\n"), MODE_FILE),
                (".gitignore", blob(repo, b"node_modules\n"), MODE_FILE),
                (".travis.yml", blob(repo, b"language: node_js\n"), MODE_FILE),
                ("LICENSE.md", blob(repo, b"MIT\n"), MODE_FILE),
                ("README.md", blob(repo, b"example app\n"), MODE_FILE),
                ("app", app, MODE_DIR),
                ("bower_components", bower, MODE_DIR),
                ("index.html", blob(repo, b"<html></html>\n"), MODE_FILE),
                ("karma.conf.js", blob(repo, b"module.exports = {};\n"), MODE_FILE),
                ("package.json", blob(repo, b"{}\n"), MODE_FILE),
                ("requireMain.js", blob(repo, b"require([]);\n"), MODE_FILE),
                ("test", test, MODE_DIR),
            ],
        )
    });

    make_repo(root.path(), "flightjs", "flightjs", |repo| {
        let css = subdir(
            repo,
            &[
                ("main.css", b"body {}\n", MODE_FILE),
                ("normalize.min.css", b"html{}\n", MODE_FILE),
            ],
        );
        let demo = subdir(repo, &[("index.html", b"<html></html>\n", MODE_FILE)]);
        let js = subdir(repo, &[("flight.js", b"// flight\n", MODE_FILE)]);
        tree(
            repo,
            &[
                ("README.md", blob(repo, b"flight\n"), MODE_FILE),
                ("css", css, MODE_DIR),
                ("demo", demo, MODE_DIR),
                ("js", js, MODE_DIR),
            ],
        )
    });

    make_repo(root.path(), "pry", "pry", |repo| {
        let bin = subdir(repo, &[("pry", b"#!/usr/bin/env ruby\n", MODE_EXEC)]);
        let lib = subdir(repo, &[("pry.rb", b"module Pry; end\n", MODE_FILE)]);
        let spec = subdir(repo, &[("pry_spec.rb", b"describe Pry do; end\n", MODE_FILE)]);
        let tasks = subdir(repo, &[("build.rake", b"task :build\n", MODE_FILE)]);
        let wiki = subdir(repo, &[("Home.md", b"wiki\n", MODE_FILE)]);
        tree(
            repo,
            &[
                ("Rakefile", blob(repo, b"require 'rake'\n"), MODE_FILE),
                ("bin", bin, MODE_DIR),
                ("lib", lib, MODE_DIR),
                ("spec", spec, MODE_DIR),
                ("tasks", tasks, MODE_DIR),
                ("wiki", wiki, MODE_DIR),
            ],
        )
    });

    make_repo(root.path(), "pry", "ruby-pry", |repo| {
        let bin = subdir(repo, &[("pry", b"#!/usr/bin/env ruby\n", MODE_EXEC)]);
        let lib = subdir(repo, &[("pry.rb", b"module Pry; end\n", MODE_FILE)]);
        let spec = subdir(repo, &[("pry_spec.rb", b"describe Pry do; end\n", MODE_FILE)]);
        tree(
            repo,
            &[
                ("Gemfile", blob(repo, b"source 'https://rubygems.org'\n"), MODE_FILE),
                ("README.md", blob(repo, b"pry\n"), MODE_FILE),
                ("bin", bin, MODE_DIR),
                ("lib", lib, MODE_DIR),
                ("spec", spec, MODE_DIR),
            ],
        )
    });

    make_repo(root.path(), "remnux", "remnux", |repo| {
        let docs = subdir(repo, &[("index.md", b"# remnux\n", MODE_FILE)]);
        let images = subdir(repo, &[("logo.png", b"\x89PNG\r\n", MODE_FILE)]);
        let scripts = subdir(repo, &[("setup.sh", b"#!/bin/sh\n", MODE_EXEC)]);
        tree(
            repo,
            &[
                ("README.md", blob(repo, b"remnux\n"), MODE_FILE),
                ("docs", docs, MODE_DIR),
                ("images", images, MODE_DIR),
                ("scripts", scripts, MODE_DIR),
            ],
        )
    });

    // Entries that every listing must filter out: a plain file at the root,
    // and a directory without the `.git` suffix plus a file at user level.
    std::fs::write(root.path().join("stray-file"), "not a user\n").unwrap();
    std::fs::create_dir(root.path().join("flightjs").join("scratch")).unwrap();
    std::fs::write(root.path().join("flightjs").join("TODO.txt"), "ignore me\n").unwrap();

    Fixture { root }
}

pub fn make_repo(root: &Path, user: &str, name: &str, build: impl FnOnce(&Repository) -> Oid) {
    let dir = root.join(user).join(format!("{name}.git"));
    std::fs::create_dir_all(&dir).unwrap();
    let repo = Repository::init_bare(&dir).unwrap();
    let tree_id = build(&repo);
    commit_on_master(&repo, tree_id, &[]);
}

pub fn blob(repo: &Repository, content: &[u8]) -> Oid {
    repo.blob(content).unwrap()
}

/// Build a tree from `(name, oid, filemode)` triples. git orders the
/// entries itself.
pub fn tree(repo: &Repository, entries: &[(&str, Oid, i32)]) -> Oid {
    let mut builder = repo.treebuilder(None).unwrap();
    for (name, oid, filemode) in entries {
        builder.insert(name, *oid, *filemode).unwrap();
    }
    builder.write().unwrap()
}

fn subdir(repo: &Repository, files: &[(&str, &[u8], i32)]) -> Oid {
    let entries: Vec<(&str, Oid, i32)> = files
        .iter()
        .map(|(name, content, mode)| (*name, blob(repo, content), *mode))
        .collect();
    tree(repo, &entries)
}

pub fn commit_on_master(repo: &Repository, tree_id: Oid, parents: &[&git2::Commit<'_>]) -> Oid {
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("testuser", "test@example.com").unwrap();
    repo.commit(Some("refs/heads/master"), &sig, &sig, "fixture", &tree, parents)
        .unwrap()
}
