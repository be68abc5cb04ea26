//! Repository view caching.

/// Fixed-capacity LRU map primitive.
pub mod lru;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::fs::view::RepoView;
use lru::LruCache;

/// Default number of repository views kept open at once.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Shared LRU of opened [`RepoView`]s keyed by the absolute bare-repository
/// path.
///
/// Values are reference counted: eviction, removal and purge drop the
/// cache's strong reference outside the cache lock, so concurrent readers
/// holding a clone finish before the underlying libgit2 handles are
/// released, and the handles are released exactly once.
pub struct RepoCache {
    inner: Mutex<LruCache<PathBuf, Arc<RepoView>>>,
}

impl RepoCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<PathBuf, Arc<RepoView>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite a view, touching recency. When the insert
    /// overflows capacity, the least recently used view is disposed before
    /// this call returns.
    pub fn add(&self, key: PathBuf, view: Arc<RepoView>) {
        let displaced = {
            let mut cache = self.lock();
            cache.add(key, view)
        };
        // The lock is gone; dropping the displaced view may free libgit2
        // handles.
        drop(displaced);
    }

    /// Fetch the view for `key`, touching recency.
    #[must_use]
    pub fn get(&self, key: &Path) -> Option<Arc<RepoView>> {
        self.lock().get(&key.to_path_buf())
    }

    /// Remove one view. Idempotent.
    pub fn remove(&self, key: &Path) {
        let removed = {
            let mut cache = self.lock();
            cache.remove(&key.to_path_buf())
        };
        drop(removed);
    }

    /// Drop every cached view; the next request re-materializes them.
    pub fn purge(&self) {
        let drained = {
            let mut cache = self.lock();
            cache.drain()
        };
        debug!(count = drained.len(), "purged repository cache");
        drop(drained);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
