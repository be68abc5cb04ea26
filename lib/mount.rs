//! Mount lifecycle: a temporary mountpoint, the serving session and the
//! teardown path.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use fuser::{MountOption, Session, SessionUnmounter};
use tempfile::TempDir;
use tracing::{debug, error, info};

use crate::cache;
use crate::fs::fuser::FuserAdapter;
use crate::fs::pagesfs::PagesFs;

/// Inputs consumed by [`GitFs::new`].
#[derive(Debug, Clone)]
pub struct GitFsConfig {
    /// Directory holding `user/repo.git` bare repositories.
    pub repo_root: PathBuf,
    /// Trace every FUSE request.
    pub debug: bool,
}

/// Shared teardown handle: the FUSE adapter uses it to convert a callback
/// panic into an unmount, and [`GitFs::unmount`] goes through it too.
pub(crate) struct MountControl {
    mountpoint: PathBuf,
    unmounter: Mutex<Option<SessionUnmounter>>,
    serving: Mutex<bool>,
    serving_cond: Condvar,
}

impl MountControl {
    fn new(mountpoint: PathBuf) -> Self {
        Self {
            mountpoint,
            unmounter: Mutex::new(None),
            serving: Mutex::new(false),
            serving_cond: Condvar::new(),
        }
    }

    fn set_unmounter(&self, unmounter: SessionUnmounter) {
        *lock(&self.unmounter) = Some(unmounter);
    }

    fn mark_serving(&self) {
        *lock(&self.serving) = true;
        self.serving_cond.notify_all();
    }

    fn wait_serving(&self) {
        let mut serving = lock(&self.serving);
        while !*serving {
            serving = self
                .serving_cond
                .wait(serving)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Tear down the kernel mount. Idempotent: after the first call the
    /// unmounter is gone and subsequent calls are no-ops.
    pub(crate) fn unmount(&self) -> io::Result<()> {
        let Some(mut unmounter) = lock(&self.unmounter).take() else {
            return Ok(());
        };
        match unmounter.unmount() {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, "session unmount failed, forcing a detach");
                force_unmount(&self.mountpoint)
            }
        }
    }

    /// Unmount from a context that must not block, e.g. the recovery path of
    /// a panicking FUSE callback.
    pub(crate) fn unmount_in_background(self: &Arc<Self>) {
        let control = Arc::clone(self);
        thread::spawn(move || {
            if let Err(e) = control.unmount() {
                error!(error = %e, "failed to unmount after callback panic");
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(target_os = "linux")]
fn force_unmount(mountpoint: &Path) -> io::Result<()> {
    use nix::errno::Errno;
    match nix::mount::umount2(mountpoint, nix::mount::MntFlags::MNT_DETACH) {
        Ok(()) | Err(Errno::EINVAL | Errno::ENOENT) => Ok(()),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

#[cfg(target_os = "macos")]
fn force_unmount(mountpoint: &Path) -> io::Result<()> {
    use nix::errno::Errno;
    match nix::mount::unmount(mountpoint, nix::mount::MntFlags::MNT_FORCE) {
        Ok(()) | Err(Errno::EINVAL | Errno::ENOENT) => Ok(()),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

/// A mounted, read-only Git filesystem endpoint on a freshly allocated
/// temporary mountpoint.
pub struct GitFs {
    fs: Arc<PagesFs>,
    control: Arc<MountControl>,
    mountpoint: PathBuf,
    tempdir: Mutex<Option<TempDir>>,
    session: Mutex<Option<Session<FuserAdapter>>>,
}

impl GitFs {
    /// Allocate a temporary mountpoint and mount the adapter there. The
    /// repository cache starts empty with the default capacity. When the
    /// mount fails the temporary directory is removed before returning.
    pub fn new(config: GitFsConfig) -> io::Result<Self> {
        let tempdir = tempfile::Builder::new().prefix("gitfs").tempdir()?;
        let mountpoint = tempdir.path().to_path_buf();

        let fs = Arc::new(PagesFs::new(
            config.repo_root,
            cache::DEFAULT_CAPACITY,
            config.debug,
        ));
        let control = Arc::new(MountControl::new(mountpoint.clone()));
        let adapter = FuserAdapter::new(Arc::clone(&fs), Arc::clone(&control));

        let options = [
            MountOption::RO,
            MountOption::FSName("gitfs".to_owned()),
            MountOption::NoDev,
            MountOption::DefaultPermissions,
        ];
        // On mount failure `tempdir` drops on the early return, removing
        // the directory.
        let mut session = Session::new(adapter, &mountpoint, &options).map_err(|e| {
            error!(mountpoint = %mountpoint.display(), error = %e, "failed to mount GitFS");
            e
        })?;
        control.set_unmounter(session.unmount_callable());
        debug!(mountpoint = %mountpoint.display(), "mounted GitFS");

        Ok(Self {
            fs,
            control,
            mountpoint,
            tempdir: Mutex::new(Some(tempdir)),
            session: Mutex::new(Some(session)),
        })
    }

    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Serve kernel requests until the endpoint is unmounted, then remove
    /// the temporary mountpoint. Returns immediately if the serve loop
    /// already ran.
    pub fn start(&self) {
        let Some(mut session) = lock(&self.session).take() else {
            debug!("serve loop already consumed");
            return;
        };
        self.control.mark_serving();
        info!("start to serve FUSE requests");
        if let Err(e) = session.run() {
            error!(error = %e, "FUSE session ended with an error");
        }
        drop(session);
        debug!(mountpoint = %self.mountpoint.display(), "FUSE stopping, removing mountpoint");
        drop(lock(&self.tempdir).take());
    }

    /// Block until the serve loop has started, so siblings and tests can
    /// probe the mount.
    pub fn wait_mounted(&self) {
        self.control.wait_serving();
    }

    /// Tear down the kernel mount. Idempotent.
    pub fn unmount(&self) -> io::Result<()> {
        self.control.unmount()
    }

    /// Drop every cached repository view; the next request rebuilds them.
    /// Collaborators call this after mutating a repository.
    pub fn purge(&self) {
        self.fs.purge();
    }
}
