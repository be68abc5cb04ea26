//! Snapshot of one repository's `master` branch: the opened repository, the
//! commit `master` points at and that commit's root tree.
//!
//! Trees and blobs are materialized as short-lived borrows inside each
//! operation, so every sub-handle is released before the repository itself.
//! The cache holds views behind [`Arc`](std::sync::Arc); libgit2 frees the
//! underlying handles exactly once, when the last reference drops.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use git2::{BranchType, ObjectType, Oid, Repository, Tree};
use tracing::{debug, error};

use super::{FILEMODE_LINK, FsError};

/// Resolved metadata for one entry inside the branch tree.
#[derive(Debug, Clone, Copy)]
pub(crate) enum EntryStat {
    Tree { oid: Oid, subtree_count: u32 },
    Blob { oid: Oid, filemode: i32, size: u64 },
}

/// An opened bare repository pinned to the tree its local `master` branch
/// pointed at when the view was created. External pushes are only observed
/// after the view is dropped from the cache and reopened.
pub struct RepoView {
    // git2::Repository is Send but not Sync; object reads are serialized
    // through this mutex, held for at most one lookup.
    repo: Mutex<Repository>,
    commit_id: Oid,
    tree_id: Oid,
}

impl RepoView {
    /// Open `path` and resolve `master` down to its root tree. Any failure
    /// releases the handles acquired so far and reports the first error;
    /// a missing repository maps to [`FsError::NotFound`], everything else
    /// to [`FsError::Denied`].
    pub fn open(path: &Path) -> Result<Self, FsError> {
        let repo = Repository::open(path).map_err(|e| {
            debug!(path = %path.display(), error = %e, "failed to open repository");
            if e.code() == git2::ErrorCode::NotFound {
                FsError::NotFound
            } else {
                FsError::Denied
            }
        })?;
        debug!(path = %path.display(), "opened repository");

        let (commit_id, tree_id) = {
            let branch = repo
                .find_branch("master", BranchType::Local)
                .map_err(|e| {
                    error!(path = %path.display(), error = %e, "failed to resolve master branch");
                    FsError::Denied
                })?;
            let target = branch.get().target().ok_or_else(|| {
                error!(path = %path.display(), "master branch has no target commit");
                FsError::Denied
            })?;
            let commit = repo.find_commit(target).map_err(|e| {
                error!(path = %path.display(), error = %e, "failed to resolve master commit");
                FsError::Denied
            })?;
            (commit.id(), commit.tree_id())
        };
        debug!(path = %path.display(), commit = %commit_id, tree = %tree_id, "resolved master tree");

        Ok(Self {
            repo: Mutex::new(repo),
            commit_id,
            tree_id,
        })
    }

    pub(crate) fn commit_id(&self) -> Oid {
        self.commit_id
    }

    fn lock(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `intra` against the root tree. Missing paths and entries of
    /// unprojectable kinds (gitlinks) report [`FsError::NotFound`].
    pub(crate) fn stat_path(&self, intra: &str) -> Result<EntryStat, FsError> {
        let repo = self.lock();
        let root = find_tree(&repo, self.tree_id)?;
        let entry = root.get_path(Path::new(intra)).map_err(|e| {
            debug!(tree = %self.tree_id, path = intra, error = %e, "path not present in tree");
            FsError::NotFound
        })?;
        match entry.kind() {
            Some(ObjectType::Tree) => {
                let subtree = find_tree(&repo, entry.id())?;
                Ok(EntryStat::Tree {
                    oid: entry.id(),
                    subtree_count: count_subtrees(&subtree),
                })
            }
            Some(ObjectType::Blob) => {
                let blob = repo.find_blob(entry.id()).map_err(|e| {
                    error!(blob = %entry.id(), error = %e, "failed to open blob");
                    FsError::Denied
                })?;
                Ok(EntryStat::Blob {
                    oid: entry.id(),
                    filemode: entry.filemode(),
                    size: blob.size() as u64,
                })
            }
            _ => {
                debug!(tree = %self.tree_id, path = intra, "unsupported object kind");
                Err(FsError::NotFound)
            }
        }
    }

    /// Number of direct subtree children of the branch root.
    pub(crate) fn root_subtree_count(&self) -> Result<u32, FsError> {
        let repo = self.lock();
        let root = find_tree(&repo, self.tree_id)?;
        Ok(count_subtrees(&root))
    }

    /// Enumerate `(name, filemode, id)` for the tree at `intra` (`""` is the
    /// branch root). Entries of kinds other than tree/blob are dropped;
    /// resolving a non-tree reports [`FsError::Invalid`].
    pub(crate) fn list(&self, intra: &str) -> Result<Vec<(Vec<u8>, i32, Oid)>, FsError> {
        let repo = self.lock();
        let root = find_tree(&repo, self.tree_id)?;
        let tree = if intra.is_empty() {
            root
        } else {
            let entry = root.get_path(Path::new(intra)).map_err(|e| {
                debug!(tree = %self.tree_id, path = intra, error = %e, "path not present in tree");
                FsError::NotFound
            })?;
            if entry.kind() != Some(ObjectType::Tree) {
                debug!(tree = %self.tree_id, path = intra, "expected a tree");
                return Err(FsError::Invalid);
            }
            find_tree(&repo, entry.id())?
        };

        let mut entries = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            if matches!(entry.kind(), Some(ObjectType::Tree | ObjectType::Blob)) {
                entries.push((entry.name_bytes().to_vec(), entry.filemode(), entry.id()));
            }
        }
        Ok(entries)
    }

    /// Blob contents of the regular file at `intra`.
    pub(crate) fn read_blob(&self, intra: &str) -> Result<Vec<u8>, FsError> {
        let repo = self.lock();
        let root = find_tree(&repo, self.tree_id)?;
        let entry = root
            .get_path(Path::new(intra))
            .map_err(|_| FsError::NotFound)?;
        if entry.kind() != Some(ObjectType::Blob) {
            return Err(FsError::Invalid);
        }
        let blob = repo.find_blob(entry.id()).map_err(|e| {
            error!(blob = %entry.id(), error = %e, "failed to open blob");
            FsError::Denied
        })?;
        Ok(blob.content().to_vec())
    }

    /// Link target of the symlink at `intra`: the raw blob bytes. Existing
    /// non-symlink entries report [`FsError::Invalid`].
    pub(crate) fn read_link(&self, intra: &str) -> Result<Vec<u8>, FsError> {
        let repo = self.lock();
        let root = find_tree(&repo, self.tree_id)?;
        let entry = root
            .get_path(Path::new(intra))
            .map_err(|_| FsError::NotFound)?;
        if entry.filemode() != FILEMODE_LINK || entry.kind() != Some(ObjectType::Blob) {
            return Err(FsError::Invalid);
        }
        let blob = repo.find_blob(entry.id()).map_err(|e| {
            error!(blob = %entry.id(), error = %e, "failed to open blob");
            FsError::Denied
        })?;
        Ok(blob.content().to_vec())
    }
}

fn find_tree(repo: &Repository, id: Oid) -> Result<Tree<'_>, FsError> {
    repo.find_tree(id).map_err(|e| {
        error!(tree = %id, error = %e, "failed to open tree");
        FsError::Denied
    })
}

fn count_subtrees(tree: &Tree<'_>) -> u32 {
    tree.iter()
        .filter(|entry| entry.kind() == Some(ObjectType::Tree))
        .count() as u32
}
