//! FUSE adapter: maps [`fuser::Filesystem`] callbacks onto [`PagesFs`].
//!
//! fuser addresses files by inode, while [`PagesFs`] is path-addressed, so
//! the adapter keeps a bidirectional inode/path table populated by `lookup`.
//! Inode numbers are the ones reported in [`Attr::ino`]: the CRC-64 of the
//! object id for Git-sourced entries and the backing `st_ino` for the top
//! two levels. Identical objects share an id and therefore an inode, which
//! resolves identically either way; collisions between distinct objects are
//! accepted and nothing depends on inode uniqueness.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use fuser::{
    FUSE_ROOT_ID, FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request,
    TimeOrNow,
};
use tracing::{debug, error};

use super::Attr;
use super::pagesfs::PagesFs;
use crate::mount::MountControl;

/// Kernel cache TTL for entries and attributes. Git-sourced timestamps are
/// wall-clock "now", so a short TTL keeps `purge()` effects visible.
const ATTR_TTL: Duration = Duration::from_secs(1);

fn attr_to_fuse(attr: &Attr) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: kind_of(attr.mode),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn kind_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_owned())
}

/// Bidirectional inode <-> mount-relative-path table. The root is
/// [`FUSE_ROOT_ID`] and maps to the empty path.
struct InodeTable {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inos: HashMap::new(),
        };
        table.register(FUSE_ROOT_ID, String::new());
        table
    }

    fn register(&mut self, ino: u64, path: String) {
        if let Some(previous) = self.paths.insert(ino, path.clone()) {
            if previous != path {
                self.inos.remove(&previous);
            }
        }
        self.inos.insert(path, ino);
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    fn ino_of(&self, path: &str) -> Option<u64> {
        self.inos.get(path).copied()
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}

/// Bridges the kernel's VFS callbacks to the path-addressed [`PagesFs`].
///
/// Every callback body runs under `catch_unwind`: a panic is logged, the
/// request fails with `EIO`, and the server is unmounted in the background
/// -- once a callback has torn down, the mount cannot continue correctly.
pub struct FuserAdapter {
    fs: Arc<PagesFs>,
    control: Arc<MountControl>,
    inodes: InodeTable,
    open_files: HashMap<u64, Bytes>,
    next_fh: u64,
}

impl FuserAdapter {
    pub(crate) fn new(fs: Arc<PagesFs>, control: Arc<MountControl>) -> Self {
        Self {
            fs,
            control,
            inodes: InodeTable::new(),
            open_files: HashMap::new(),
            next_fh: 1,
        }
    }

    fn trace(&self, op: &str, path: &str) {
        if self.fs.debug_enabled() {
            debug!(op, path, "fuse request");
        }
    }

    fn resolve(&self, ino: u64) -> Result<String, i32> {
        self.inodes
            .path_of(ino)
            .map(str::to_owned)
            .ok_or(libc::ENOENT)
    }

    /// Run a callback body, converting a panic into `EIO` plus an
    /// asynchronous unmount.
    fn guarded<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut Self) -> Result<T, i32>,
    ) -> Result<T, i32> {
        let this = &mut *self;
        match panic::catch_unwind(AssertUnwindSafe(move || f(this))) {
            Ok(result) => result,
            Err(payload) => {
                error!(op, panic = %panic_message(payload.as_ref()), "panic in FUSE callback, unmounting");
                self.control.unmount_in_background();
                Err(libc::EIO)
            }
        }
    }

    fn attr_for(&mut self, ino: u64, path: &str) -> Result<Attr, i32> {
        let mut attr = self.fs.getattr(path).map_err(|e| e.errno())?;
        if ino == FUSE_ROOT_ID {
            attr.ino = FUSE_ROOT_ID;
        } else {
            self.inodes.register(attr.ino, path.to_owned());
        }
        Ok(attr)
    }
}

impl Filesystem for FuserAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.guarded("lookup", |this| {
            let parent_path = this.resolve(parent)?;
            let Some(name) = name.to_str() else {
                return Err(libc::ENOENT);
            };
            let path = join_path(&parent_path, name);
            this.trace("lookup", &path);
            let attr = this.fs.getattr(&path).map_err(|e| e.errno())?;
            this.inodes.register(attr.ino, path);
            Ok(attr)
        });
        match result {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr_to_fuse(&attr), 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = self.guarded("getattr", |this| {
            let path = this.resolve(ino)?;
            this.trace("getattr", &path);
            this.attr_for(ino, &path)
        });
        match result {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr_to_fuse(&attr)),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let result = self.guarded("readdir", |this| {
            let path = this.resolve(ino)?;
            this.trace("readdir", &path);
            let entries = this.fs.readdir(&path).map_err(|e| e.errno())?;
            let parent_ino = match path.rfind('/') {
                Some(idx) => this.inodes.ino_of(&path[..idx]).unwrap_or(FUSE_ROOT_ID),
                None => FUSE_ROOT_ID,
            };
            Ok((entries, parent_ino))
        });
        let (entries, parent_ino) = match result {
            Ok(listing) => listing,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let offset = usize::try_from(offset).unwrap_or(0);
        let synthetic = [
            (ino, FileType::Directory, OsStr::new(".")),
            (parent_ino, FileType::Directory, OsStr::new("..")),
        ];
        let all = synthetic.into_iter().chain(
            entries
                .iter()
                .map(|e| (e.ino, kind_of(e.mode), e.name.as_os_str())),
        );
        for (index, (entry_ino, kind, name)) in all.enumerate().skip(offset) {
            if reply.add(entry_ino, (index + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self.guarded("readlink", |this| {
            let path = this.resolve(ino)?;
            this.trace("readlink", &path);
            this.fs.readlink(&path).map_err(|e| e.errno())
        });
        match result {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self.guarded("open", |this| {
            if flags & libc::O_ACCMODE != libc::O_RDONLY {
                return Err(libc::EPERM);
            }
            let path = this.resolve(ino)?;
            this.trace("open", &path);
            let content = Bytes::from(this.fs.read_file(&path).map_err(|e| e.errno())?);
            let fh = this.next_fh;
            this.next_fh += 1;
            this.open_files.insert(fh, content);
            Ok(fh)
        });
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.guarded("read", |this| {
            let content = this.open_files.get(&fh).ok_or(libc::EBADF)?;
            let offset = usize::try_from(offset).unwrap_or(0);
            if offset >= content.len() {
                return Ok(Bytes::new());
            }
            let end = content.len().min(offset + size as usize);
            Ok(content.slice(offset..end))
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if self.open_files.remove(&fh).is_some() {
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self.guarded("listxattr", |this| {
            let path = this.resolve(ino)?;
            this.trace("listxattr", &path);
            this.fs.listxattr(&path).map_err(|e| e.errno())
        });
        match result {
            // The list is empty by contract.
            Ok(_) => {
                if size == 0 {
                    reply.size(0);
                } else {
                    reply.data(&[]);
                }
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        let result = self.guarded("getxattr", |this| {
            let path = this.resolve(ino)?;
            this.trace("getxattr", &path);
            this.fs
                .getxattr(&path, &name.to_string_lossy())
                .map_err(|e| e.errno())
        });
        match result {
            Ok(_) => reply.error(libc::ENODATA),
            Err(errno) => reply.error(errno),
        }
    }

    // The filesystem is strictly read-only: every mutating operation fails
    // with a permission error.

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(libc::EPERM);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EPERM);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EPERM);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EPERM);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(libc::EPERM);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(libc::EPERM);
    }
}
