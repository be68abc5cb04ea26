//! Path-addressed read-only operations over every repository under the
//! configured root.
//!
//! All operations dispatch on the `(user, repo, intra)` split of the
//! mount-relative path: requests at the top two levels consult the real
//! backing directory (with write bits cleared), everything deeper goes
//! through the cached [`RepoView`] of `root/user/repo.git`.

use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStringExt as _;
use std::os::unix::fs::MetadataExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, error};

use super::view::{EntryStat, RepoView};
use super::{
    Attr, DirEntry, FILEMODE_TREE, FsError, WRITE_BITS, mode_from_filemode, oid_ino, split_path,
};
use crate::cache::RepoCache;

pub struct PagesFs {
    repo_root: PathBuf,
    cache: RepoCache,
    debug: bool,
}

impl PagesFs {
    #[must_use]
    pub fn new(repo_root: PathBuf, cache_capacity: usize, debug: bool) -> Self {
        Self {
            repo_root,
            cache: RepoCache::new(cache_capacity),
            debug,
        }
    }

    /// Whether per-request tracing was requested at mount time.
    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// Drop every cached repository view. Collaborators call this after
    /// mutating a repository; the next request reflects the new tree.
    pub fn purge(&self) {
        self.cache.purge();
    }

    fn repo_path(&self, user: &str, repo: &str) -> PathBuf {
        self.repo_root.join(user).join(format!("{repo}.git"))
    }

    /// The cached view for `root/user/repo.git`, materialized on miss.
    fn view_for(&self, user: &str, repo: &str) -> Result<(Arc<RepoView>, PathBuf), FsError> {
        let path = self.repo_path(user, repo);
        if let Some(view) = self.cache.get(&path) {
            debug!(path = %path.display(), commit = %view.commit_id(), "repository cache hit");
            return Ok((view, path));
        }
        debug!(path = %path.display(), "repository cache miss");
        let view = Arc::new(RepoView::open(&path)?);
        self.cache.add(path.clone(), Arc::clone(&view));
        Ok((view, path))
    }

    pub fn getattr(&self, path: &str) -> Result<Attr, FsError> {
        let (user, repo, intra) = split_path(path);
        if repo.is_empty() {
            let md = fs::metadata(self.repo_root.join(user)).map_err(|e| {
                debug!(user, error = %e, "failed to stat backing directory");
                FsError::from_io(&e)
            })?;
            return Ok(Attr::from_backing(&md));
        }

        let (view, repo_path) = self.view_for(user, repo)?;
        let repo_md = fs::metadata(&repo_path).map_err(|e| {
            debug!(path = %repo_path.display(), error = %e, "failed to stat repository directory");
            FsError::from_io(&e)
        })?;

        if intra.is_empty() {
            let mut attr = Attr::from_backing(&repo_md);
            attr.nlink = 2 + view.root_subtree_count()?;
            return Ok(attr);
        }

        let (ino, mode, nlink, size) = match view.stat_path(intra)? {
            EntryStat::Tree { oid, subtree_count } => (
                oid_ino(oid),
                mode_from_filemode(FILEMODE_TREE),
                2 + subtree_count,
                4096,
            ),
            EntryStat::Blob {
                oid,
                filemode,
                size,
            } => {
                let mode = mode_from_filemode(filemode);
                if mode == 0 {
                    return Err(FsError::NotFound);
                }
                (oid_ino(oid), mode, 1, size)
            }
        };

        let now = SystemTime::now();
        Ok(Attr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            mode,
            nlink,
            uid: repo_md.uid(),
            gid: repo_md.gid(),
            rdev: repo_md.rdev() as u32,
            blksize: repo_md.blksize() as u32,
        })
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let (user, repo, intra) = split_path(path);
        if user.is_empty() {
            return self.list_backing_dirs(&self.repo_root, None);
        }
        if repo.is_empty() {
            return self.list_backing_dirs(&self.repo_root.join(user), Some(".git"));
        }

        let (view, _) = self.view_for(user, repo)?;
        let entries = view.list(intra)?;
        Ok(entries
            .into_iter()
            .filter_map(|(name, filemode, oid)| {
                let mode = mode_from_filemode(filemode);
                if mode == 0 {
                    return None;
                }
                Some(DirEntry {
                    name: OsString::from_vec(name),
                    ino: oid_ino(oid),
                    mode,
                })
            })
            .collect())
    }

    /// Real directory listing for the top two levels: only directories are
    /// kept, write bits are cleared, and with `suffix` set only names ending
    /// in it survive (the suffix stripped), which is how repository
    /// directories lose their `.git`.
    fn list_backing_dirs(
        &self,
        dir: &Path,
        suffix: Option<&str>,
    ) -> Result<Vec<DirEntry>, FsError> {
        let read = fs::read_dir(dir).map_err(|e| {
            error!(path = %dir.display(), error = %e, "failed to list backing directory");
            FsError::from_io(&e)
        })?;

        let mut entries = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| FsError::from_io(&e))?;
            let Ok(md) = entry.metadata() else { continue };
            if !md.is_dir() {
                continue;
            }
            let name = match suffix {
                Some(sfx) => {
                    let raw = entry.file_name();
                    let Some(stripped) = raw.to_str().and_then(|n| n.strip_suffix(sfx)) else {
                        continue;
                    };
                    OsString::from(stripped)
                }
                None => entry.file_name(),
            };
            entries.push(DirEntry {
                name,
                ino: md.ino(),
                mode: md.mode() & !WRITE_BITS,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Succeeds only for entries with the symlink filemode; existing
    /// non-symlinks (including the real directories of the top two levels)
    /// report [`FsError::Invalid`].
    pub fn readlink(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let (user, repo, intra) = split_path(path);
        if repo.is_empty() {
            return match fs::metadata(self.repo_root.join(user)) {
                Ok(_) => Err(FsError::Invalid),
                Err(e) => Err(FsError::from_io(&e)),
            };
        }
        let (view, _) = self.view_for(user, repo)?;
        if intra.is_empty() {
            return Err(FsError::Invalid);
        }
        view.read_link(intra)
    }

    /// Full contents of the blob at `path`, for `open`/`read`.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let (user, repo, intra) = split_path(path);
        if repo.is_empty() || intra.is_empty() {
            return Err(FsError::Invalid);
        }
        let (view, _) = self.view_for(user, repo)?;
        view.read_blob(intra)
    }

    /// Always an empty attribute list; resolution errors surface unchanged.
    pub fn listxattr(&self, path: &str) -> Result<Vec<OsString>, FsError> {
        self.getattr(path)?;
        Ok(Vec::new())
    }

    /// Always [`FsError::NoData`] for resolvable paths.
    pub fn getxattr(&self, path: &str, _name: &str) -> Result<Vec<u8>, FsError> {
        self.getattr(path)?;
        Err(FsError::NoData)
    }
}
