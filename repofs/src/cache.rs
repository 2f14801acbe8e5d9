//! The five caches: revision-root-id, dag-node, dir-entries, pack-manifest,
//! and fulltext. Each is an instance of the same `Cache<K, V>` trait so a
//! disabled cache is a zero-cost no-op, following the teacher's pattern of
//! swapping cache backends behind a trait object rather than `#[cfg]`.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use clru::CLruCache;

use crate::error::FsResult;

/// A cache slot. Implementations must be safe to call from multiple
/// threads; `get`/`put` take `&self`.
pub trait Cache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn put(&self, key: K, value: V);
    fn invalidate(&self, key: &K);
}

/// An in-process LRU cache, the default backend for all five caches.
pub struct LruCache<K: Eq + Hash, V: Clone> {
    inner: Mutex<CLruCache<K, V>>,
}

impl<K: Eq + Hash, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(CLruCache::new(capacity)),
        }
    }
}

impl<K: Eq + Hash + Send, V: Clone + Send> Cache<K, V> for LruCache<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: K, value: V) {
        self.inner.lock().unwrap().put(key, value);
    }

    fn invalidate(&self, key: &K) {
        self.inner.lock().unwrap().pop(key);
    }
}

/// A cache that never stores anything — disables a cache without changing
/// call sites.
pub struct NoopCache;

impl<K, V> Cache<K, V> for NoopCache {
    fn get(&self, _key: &K) -> Option<V> {
        None
    }
    fn put(&self, _key: K, _value: V) {}
    fn invalidate(&self, _key: &K) {}
}

/// Raised by the optional remote (memcached-style) tier when
/// `fail_stop` elevates its I/O errors to hard failures instead of the
/// default warn-and-swallow behavior.
pub fn report_cache_error(fail_stop: bool, err: impl std::fmt::Display) -> FsResult<()> {
    if fail_stop {
        return Err(crate::error::FsError::other(std::io::Error::other(err.to_string())));
    }
    tracing::warn!(error = %err, "cache operation failed, continuing without cache");
    Ok(())
}

/// The bundle of caches a repository holds. Each can be swapped for a
/// [`NoopCache`] independently via [`crate::config::FsConfig`].
pub struct Caches {
    pub revision_root_id: Box<dyn Cache<u64, crate::id::NodeRevisionId>>,
    pub dag_node: Box<dyn Cache<String, crate::dag::NodeRevision>>,
    /// Keyed by the data representation's `unparse()` string (same
    /// convention as `fulltext`), since a directory is identified by the
    /// rep that stores its encoded entries, not by the owning node-revision.
    pub dir_entries: Box<dyn Cache<String, crate::directory::Directory>>,
    pub pack_manifest: Box<dyn Cache<u64, crate::revision_file::PackManifest>>,
    pub fulltext: Box<dyn Cache<String, Vec<u8>>>,
}

impl Caches {
    pub fn new(capacities: &crate::config::CacheCapacities) -> Self {
        fn pick<K, V>(capacity: usize) -> Box<dyn Cache<K, V>>
        where
            K: Eq + Hash + Send + 'static,
            V: Clone + Send + 'static,
        {
            if capacity == 0 {
                Box::new(NoopCache)
            } else {
                Box::new(LruCache::new(capacity))
            }
        }
        Self {
            revision_root_id: pick(capacities.revision_root_id),
            dag_node: pick(capacities.dag_node),
            dir_entries: pick(capacities.dir_entries),
            pack_manifest: pick(capacities.pack_manifest),
            fulltext: pick(capacities.fulltext),
        }
    }

    pub fn disabled() -> Self {
        Self {
            revision_root_id: Box::new(NoopCache),
            dag_node: Box::new(NoopCache),
            dir_entries: Box::new(NoopCache),
            pack_manifest: Box::new(NoopCache),
            fulltext: Box::new(NoopCache),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_cache_evicts_oldest_on_overflow() {
        let cache: LruCache<u64, String> = LruCache::new(2);
        cache.put(1, "a".into());
        cache.put(2, "b".into());
        cache.put(3, "c".into());
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&3), Some("c".into()));
    }

    #[test]
    fn noop_cache_never_stores() {
        let cache = NoopCache;
        Cache::<u64, String>::put(&cache, 1, "a".into());
        assert_eq!(Cache::<u64, String>::get(&cache, &1), None);
    }
}
