//! Projection of Git object metadata into POSIX filesystem shapes.
//!
//! The mount presents a three-level namespace: the first level is one
//! directory per user, the second one directory per bare repository (the
//! `.git` suffix stripped), and everything below is the `master` branch tree
//! of that repository. The top two levels are backed by real directories on
//! disk; deeper levels are synthesized from Git objects.

/// FUSE adapter: maps [`fuser::Filesystem`] callbacks onto [`pagesfs::PagesFs`].
pub mod fuser;
/// Path-addressed read-only operations over the repository root.
pub mod pagesfs;
/// Snapshot of one repository's `master` branch.
pub mod view;

use std::ffi::OsString;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crc::{CRC_64_XZ, Crc};
use thiserror::Error;

/// Git filemode of a subtree entry.
pub(crate) const FILEMODE_TREE: i32 = 0o040_000;
/// Git filemode of a regular blob.
pub(crate) const FILEMODE_BLOB: i32 = 0o100_644;
/// Git filemode of an executable blob.
pub(crate) const FILEMODE_BLOB_EXECUTABLE: i32 = 0o100_755;
/// Git filemode of a symbolic link (a blob tagged by mode).
pub(crate) const FILEMODE_LINK: i32 = 0o120_000;

/// Write permission bits, cleared from every projected mode.
pub(crate) const WRITE_BITS: u32 = 0o222;

/// Statuses surfaced to the kernel by the read-only filesystem.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsError {
    /// The path does not resolve to an entry.
    #[error("no such entry")]
    NotFound,
    /// The entry exists but cannot satisfy the request, e.g. `readlink` of a
    /// non-symlink or `readdir` of a blob.
    #[error("invalid argument")]
    Invalid,
    /// Writes, and repository opens that fail for reasons other than a
    /// missing path.
    #[error("permission denied")]
    Denied,
    /// `getxattr` on any resolvable path.
    #[error("no extended attribute data")]
    NoData,
    /// A real `stat`/`readdir` of the backing directory failed; carries the
    /// underlying errno.
    #[error("I/O error (errno {0})")]
    Io(i32),
}

impl FsError {
    /// The errno value reported to the kernel for this status.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::Invalid => libc::EINVAL,
            Self::Denied => libc::EPERM,
            Self::NoData => libc::ENODATA,
            Self::Io(errno) => *errno,
        }
    }

    /// Status for a failed `stat`/`readdir` of a backing directory. Only
    /// missing paths map to a taxonomy kind; every other failure keeps the
    /// underlying errno as-is.
    pub(crate) fn from_io(e: &std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound
        } else {
            Self::Io(e.raw_os_error().unwrap_or(libc::EIO))
        }
    }
}

/// Split a mount-relative path into `(user, repo, intra_repo_path)`.
///
/// Absent fields are empty strings: `""` addresses the mount root,
/// `"alice"` the user directory, `"alice/blog"` the repository root and
/// `"alice/blog/posts/a.md"` a path inside the branch tree. No validation
/// happens here; empty fields are meaningful sentinels for the adapter.
#[must_use]
pub fn split_path(path: &str) -> (&str, &str, &str) {
    let mut parts = path.splitn(3, '/');
    let user = parts.next().unwrap_or("");
    let repo = parts.next().unwrap_or("");
    let intra = parts.next().unwrap_or("");
    (user, repo, intra)
}

/// Translate a Git filemode into POSIX mode bits. Filemodes without a
/// projection (gitlinks, group-writable blobs) map to `0` and are filtered
/// out by callers.
#[must_use]
pub(crate) fn mode_from_filemode(filemode: i32) -> u32 {
    match filemode {
        FILEMODE_TREE => libc::S_IFDIR | 0o555,
        FILEMODE_BLOB => libc::S_IFREG | 0o444,
        FILEMODE_BLOB_EXECUTABLE => libc::S_IFREG | 0o555,
        FILEMODE_LINK => libc::S_IFLNK | 0o777,
        _ => 0,
    }
}

const OID_CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Inode number for a Git object: a CRC-64 over the raw object id. Stable
/// across restarts; two distinct objects may collide, so nothing depends on
/// inode uniqueness.
#[must_use]
pub(crate) fn oid_ino(oid: git2::Oid) -> u64 {
    OID_CRC64.checksum(oid.as_bytes())
}

/// A `stat` projection. For Git-sourced entries the timestamps are the
/// current wall-clock instant and `uid`/`gid`/`blksize`/`rdev` are copied
/// from the real `stat` of the backing `.git` directory.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    /// `ceil(size / 512)`.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Full mode word including the `S_IFMT` type bits. Never carries any
    /// bit of `0o222`.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl Attr {
    /// Permission bits without the file type.
    #[must_use]
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    /// Project a real `stat` of a backing directory, clearing write bits.
    pub(crate) fn from_backing(md: &Metadata) -> Self {
        Self {
            ino: md.ino(),
            size: md.size(),
            blocks: md.blocks(),
            atime: unix_time(md.atime(), md.atime_nsec()),
            mtime: unix_time(md.mtime(), md.mtime_nsec()),
            ctime: unix_time(md.ctime(), md.ctime_nsec()),
            mode: md.mode() & !WRITE_BITS,
            nlink: md.nlink() as u32,
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev() as u32,
            blksize: md.blksize() as u32,
        }
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// A single `readdir` projection: the entry name plus its mode bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub mode: u32,
}

impl DirEntry {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_at_most_three_fields() {
        assert_eq!(split_path(""), ("", "", ""));
        assert_eq!(split_path("alice"), ("alice", "", ""));
        assert_eq!(split_path("alice/blog"), ("alice", "blog", ""));
        assert_eq!(split_path("alice/blog/posts"), ("alice", "blog", "posts"));
        assert_eq!(
            split_path("alice/blog/posts/2015/a.md"),
            ("alice", "blog", "posts/2015/a.md")
        );
    }

    #[test]
    fn filemode_projection_table() {
        assert_eq!(mode_from_filemode(FILEMODE_TREE), libc::S_IFDIR | 0o555);
        assert_eq!(mode_from_filemode(FILEMODE_BLOB), libc::S_IFREG | 0o444);
        assert_eq!(
            mode_from_filemode(FILEMODE_BLOB_EXECUTABLE),
            libc::S_IFREG | 0o555
        );
        assert_eq!(mode_from_filemode(FILEMODE_LINK), libc::S_IFLNK | 0o777);
        // Gitlinks and group-writable blobs have no projection.
        assert_eq!(mode_from_filemode(0o160_000), 0);
        assert_eq!(mode_from_filemode(0o100_664), 0);
    }

    #[test]
    fn projected_modes_never_carry_write_bits() {
        for filemode in [
            FILEMODE_TREE,
            FILEMODE_BLOB,
            FILEMODE_BLOB_EXECUTABLE,
            FILEMODE_LINK,
        ] {
            assert_eq!(mode_from_filemode(filemode) & WRITE_BITS, 0);
        }
    }

    #[test]
    fn oid_checksum_matches_the_ecma_polynomial() {
        // CRC-64/XZ check value, the same algorithm Go's crc64.ECMA table
        // produces over arbitrary bytes.
        assert_eq!(OID_CRC64.checksum(b"123456789"), 0x995d_c9bb_df19_39fa);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::Invalid.errno(), libc::EINVAL);
        assert_eq!(FsError::Denied.errno(), libc::EPERM);
        assert_eq!(FsError::NoData.errno(), libc::ENODATA);
        assert_eq!(FsError::Io(libc::EMFILE).errno(), libc::EMFILE);
    }

    #[test]
    fn backing_io_failures_keep_the_underlying_errno() {
        let missing = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(FsError::from_io(&missing), FsError::NotFound);

        // A permission failure on the backing directory is not a
        // permission-denied projection; the real errno passes through.
        let access = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(FsError::from_io(&access), FsError::Io(libc::EACCES));
        assert_eq!(FsError::from_io(&access).errno(), libc::EACCES);

        let loops = std::io::Error::from_raw_os_error(libc::ELOOP);
        assert_eq!(FsError::from_io(&loops), FsError::Io(libc::ELOOP));
    }
}
