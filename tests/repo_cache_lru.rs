#![allow(clippy::unwrap_used, missing_docs)]

//! Disposal accounting for the LRU: every displaced, removed or purged
//! value is dropped exactly once, and the map never exceeds its capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pagesfs::cache::lru::LruCache;

/// Bumps its counter when the last reference drops, standing in for the
/// per-entry cleaner that releases Git handles.
struct Disposal(Arc<AtomicUsize>);

impl Drop for Disposal {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn guard(counter: &Arc<AtomicUsize>) -> Arc<Disposal> {
    Arc::new(Disposal(Arc::clone(counter)))
}

#[test]
fn capacity_is_never_exceeded() {
    let disposals = counter();
    let mut cache = LruCache::new(3);
    for key in 0..10 {
        drop(cache.add(key, guard(&disposals)));
        assert!(cache.len() <= 3);
    }
    assert_eq!(cache.len(), 3);
    assert_eq!(disposals.load(Ordering::SeqCst), 7);
}

#[test]
fn eviction_follows_least_recently_used_order() {
    let a = counter();
    let b = counter();
    let c = counter();
    let mut cache = LruCache::new(2);
    drop(cache.add("a", guard(&a)));
    drop(cache.add("b", guard(&b)));

    // Touch "a" so "b" becomes the eviction victim.
    drop(cache.get(&"a"));
    drop(cache.add("c", guard(&c)));

    assert_eq!(a.load(Ordering::SeqCst), 0);
    assert_eq!(b.load(Ordering::SeqCst), 1);
    assert_eq!(c.load(Ordering::SeqCst), 0);
    assert!(cache.contains(&"a"));
    assert!(!cache.contains(&"b"));
}

#[test]
fn insertion_counts_as_use() {
    let a = counter();
    let b = counter();
    let mut cache = LruCache::new(2);
    drop(cache.add("a", guard(&a)));
    drop(cache.add("b", guard(&b)));

    // Re-inserting "a" displaces its old value and refreshes recency, so
    // the next overflow evicts "b".
    drop(cache.add("a", guard(&a)));
    assert_eq!(a.load(Ordering::SeqCst), 1);

    drop(cache.add("c", guard(&counter())));
    assert!(!cache.contains(&"b"));
    assert_eq!(b.load(Ordering::SeqCst), 1);
}

#[test]
fn remove_disposes_once_and_is_idempotent() {
    let disposals = counter();
    let mut cache = LruCache::new(2);
    drop(cache.add("a", guard(&disposals)));

    drop(cache.remove(&"a"));
    drop(cache.remove(&"a"));
    assert_eq!(disposals.load(Ordering::SeqCst), 1);
    assert!(cache.is_empty());
}

#[test]
fn purge_disposes_every_entry() {
    let disposals = counter();
    let mut cache = LruCache::new(4);
    for key in 0..4 {
        drop(cache.add(key, guard(&disposals)));
    }
    drop(cache.drain());
    assert_eq!(disposals.load(Ordering::SeqCst), 4);
    assert!(cache.is_empty());
}

#[test]
fn disposals_equal_overflows_plus_removals_plus_purge_size() {
    let disposals = counter();
    let mut cache = LruCache::new(3);

    // 5 inserts into capacity 3: 2 overflows.
    for key in 0..5 {
        drop(cache.add(key, guard(&disposals)));
    }
    // 1 explicit removal.
    drop(cache.remove(&4));
    // Purge of the remaining 2.
    drop(cache.drain());

    assert_eq!(disposals.load(Ordering::SeqCst), 2 + 1 + 2);
}

#[test]
fn values_held_by_readers_outlive_displacement() {
    let disposals = counter();
    let mut cache = LruCache::new(1);
    drop(cache.add("a", guard(&disposals)));

    // An in-flight reader keeps a clone across the eviction.
    let held = cache.get(&"a").unwrap();
    drop(cache.add("b", guard(&counter())));
    assert_eq!(disposals.load(Ordering::SeqCst), 0);

    drop(held);
    assert_eq!(disposals.load(Ordering::SeqCst), 1);
}
