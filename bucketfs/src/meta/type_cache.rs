//! Per-directory memory of what kind of entry each child name resolved to.
//!
//! Lookups consult it to decide which remote records to fetch. A cached
//! `Directory` hides a same-named file until the entry expires, and vice versa.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

/// Type cache of a single directory.
pub struct TypeCache {
    ttl: Duration,
    entries: LruCache<String, (EntryType, Instant)>,
}

impl TypeCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: LruCache::new(cap),
        }
    }

    pub fn insert(&mut self, now: Instant, name: &str, kind: EntryType) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.put(name.to_string(), (kind, now + self.ttl));
    }

    pub fn erase(&mut self, name: &str) {
        self.entries.pop(name);
    }

    pub fn get(&mut self, now: Instant, name: &str) -> Option<EntryType> {
        let (kind, expiration) = *self.entries.get(name)?;
        if expiration < now {
            self.entries.pop(name);
            return None;
        }
        Some(kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Type caches of the most recently used directories of a mount, keyed by
/// directory prefix (`""` for the root, otherwise ending with `/`). A
/// directory whose cache empties out gives up its slot.
pub struct TypeCacheRegistry {
    ttl: Duration,
    max_entries_per_dir: usize,
    dirs: Mutex<LruCache<String, TypeCache>>,
}

impl TypeCacheRegistry {
    pub fn new(max_dirs: usize, max_entries_per_dir: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_dirs).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            max_entries_per_dir,
            dirs: Mutex::new(LruCache::new(cap)),
        }
    }

    fn dirs(&self) -> MutexGuard<'_, LruCache<String, TypeCache>> {
        self.dirs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, dir: &str, now: Instant, name: &str, kind: EntryType) {
        if self.ttl.is_zero() {
            return;
        }
        let mut dirs = self.dirs();
        if let Some(cache) = dirs.get_mut(dir) {
            cache.insert(now, name, kind);
            return;
        }
        let mut cache = TypeCache::new(self.max_entries_per_dir, self.ttl);
        cache.insert(now, name, kind);
        dirs.put(dir.to_string(), cache);
    }

    pub fn get(&self, dir: &str, now: Instant, name: &str) -> Option<EntryType> {
        let mut dirs = self.dirs();
        let cache = dirs.get_mut(dir)?;
        let kind = cache.get(now, name);
        if cache.is_empty() {
            dirs.pop(dir);
        }
        kind
    }

    pub fn erase(&self, dir: &str, name: &str) {
        let mut dirs = self.dirs();
        let Some(cache) = dirs.peek_mut(dir) else {
            return;
        };
        cache.erase(name);
        if cache.is_empty() {
            dirs.pop(dir);
        }
    }

    /// Forgets the type caches of `prefix` and of every directory below it.
    pub fn erase_dirs_under(&self, prefix: &str) {
        let mut dirs = self.dirs();
        let doomed: Vec<String> = dirs
            .iter()
            .filter(|(dir, _)| dir.starts_with(prefix))
            .map(|(dir, _)| dir.clone())
            .collect();
        for dir in doomed {
            dirs.pop(&dir);
        }
    }

    /// Number of directories currently holding a type cache.
    pub fn dir_count(&self) -> usize {
        self.dirs().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_expire() {
        let mut cache = TypeCache::new(10, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert(now, "foo", EntryType::Directory);
        assert_eq!(cache.get(now, "foo"), Some(EntryType::Directory));
        assert_eq!(
            cache.get(now + Duration::from_secs(60), "foo"),
            Some(EntryType::Directory)
        );
        assert_eq!(cache.get(now + Duration::from_secs(61), "foo"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_overrides_and_erase() {
        let mut cache = TypeCache::new(10, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert(now, "foo", EntryType::Directory);
        cache.insert(now, "foo", EntryType::File);
        assert_eq!(cache.get(now, "foo"), Some(EntryType::File));
        cache.erase("foo");
        assert_eq!(cache.get(now, "foo"), None);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut cache = TypeCache::new(2, Duration::from_secs(60));
        let now = Instant::now();
        cache.insert(now, "a", EntryType::File);
        cache.insert(now, "b", EntryType::File);
        cache.insert(now, "c", EntryType::File);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(now, "a"), None);
    }

    #[test]
    fn test_zero_ttl_disables_caching() {
        let registry = TypeCacheRegistry::new(10, 10, Duration::ZERO);
        let now = Instant::now();
        registry.insert("", now, "foo", EntryType::File);
        assert_eq!(registry.get("", now, "foo"), None);
    }

    #[test]
    fn test_registry_is_per_directory() {
        let registry = TypeCacheRegistry::new(10, 10, Duration::from_secs(60));
        let now = Instant::now();
        registry.insert("", now, "foo", EntryType::Directory);
        registry.insert("foo/", now, "foo", EntryType::File);
        registry.insert("foo/bar/", now, "baz", EntryType::Symlink);

        assert_eq!(registry.get("", now, "foo"), Some(EntryType::Directory));
        assert_eq!(registry.get("foo/", now, "foo"), Some(EntryType::File));

        registry.erase_dirs_under("foo/");
        assert_eq!(registry.get("foo/", now, "foo"), None);
        assert_eq!(registry.get("foo/bar/", now, "baz"), None);
        assert_eq!(registry.get("", now, "foo"), Some(EntryType::Directory));
    }

    #[test]
    fn test_registry_bounds_directories() {
        let registry = TypeCacheRegistry::new(3, 1, Duration::from_secs(60));
        let now = Instant::now();
        for i in 0..1000 {
            registry.insert(&format!("dir{i}/"), now, "f", EntryType::File);
        }
        assert_eq!(registry.dir_count(), 3);
        assert_eq!(registry.get("dir0/", now, "f"), None);
        assert_eq!(registry.get("dir999/", now, "f"), Some(EntryType::File));
    }

    #[test]
    fn test_registry_drops_emptied_directories() {
        let registry = TypeCacheRegistry::new(10, 10, Duration::from_secs(60));
        let now = Instant::now();
        registry.insert("a/", now, "x", EntryType::File);
        registry.insert("b/", now, "y", EntryType::Directory);
        registry.insert("b/", now, "z", EntryType::File);
        assert_eq!(registry.dir_count(), 2);

        registry.erase("a/", "x");
        assert_eq!(registry.dir_count(), 1);

        let later = now + Duration::from_secs(61);
        assert_eq!(registry.get("b/", later, "y"), None);
        assert_eq!(registry.dir_count(), 1);
        assert_eq!(registry.get("b/", later, "z"), None);
        assert_eq!(registry.dir_count(), 0);
    }
}
