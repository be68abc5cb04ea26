//! pages shared library: bare Git repositories projected as a read-only
//! filesystem tree.

/// Caching of opened repository views.
pub mod cache;
/// Filesystem projection and the FUSE adapter.
pub mod fs;
/// Mount lifecycle management.
pub mod mount;

pub use cache::RepoCache;
pub use fs::pagesfs::PagesFs;
pub use fs::{Attr, DirEntry, FsError};
pub use mount::{GitFs, GitFsConfig};
