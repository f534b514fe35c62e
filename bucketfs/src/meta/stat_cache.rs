//! Bounded LRU of object metadata with per-entry expiry.
//!
//! One [`SharedStatCache`] serves every bucket of a mount; each bucket talks to
//! it through a [`StatCacheBucketView`] whose scope is folded into the key, so
//! equal object names in different buckets never collide.
//!
//! Entries are either positive (the object record) or negative (the name was
//! observed not to exist). Expiry is lazy: an expired entry is dropped when a
//! lookup finds it.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use lru::LruCache;

use crate::cadapter::ObjectRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    scope: String,
    name: String,
}

#[derive(Debug, Clone)]
struct StatCacheEntry {
    /// `None` is a negative entry.
    record: Option<ObjectRecord>,
    expiration: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(ObjectRecord),
    /// The name was recently observed not to exist.
    NegativeHit,
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

pub struct SharedStatCache {
    entries: Mutex<LruCache<CacheKey, StatCacheEntry>>,
}

impl SharedStatCache {
    pub fn new(max_entries: usize) -> Arc<Self> {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            entries: Mutex::new(LruCache::new(cap)),
        })
    }

    pub fn view(self: &Arc<Self>, scope: impl Into<String>) -> StatCacheBucketView {
        StatCacheBucketView {
            shared: Arc::clone(self),
            scope: scope.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, StatCacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bucket-scoped handle onto a [`SharedStatCache`].
#[derive(Clone)]
pub struct StatCacheBucketView {
    shared: Arc<SharedStatCache>,
    scope: String,
}

impl StatCacheBucketView {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn key(&self, name: &str) -> CacheKey {
        CacheKey {
            scope: self.scope.clone(),
            name: name.to_string(),
        }
    }

    /// Records `record` until `expiration`. A cached positive entry for a newer
    /// generation of the same name is kept instead.
    pub fn insert(&self, record: ObjectRecord, expiration: Instant) {
        let key = self.key(&record.name);
        let mut entries = self.shared.lock();
        let newer_cached = entries
            .peek(&key)
            .and_then(|e| e.record.as_ref())
            .is_some_and(|existing| existing.generation > record.generation);
        if newer_cached {
            return;
        }
        entries.put(
            key,
            StatCacheEntry {
                record: Some(record),
                expiration,
            },
        );
    }

    pub fn add_negative_entry(&self, name: &str, expiration: Instant) {
        let key = self.key(name);
        self.shared.lock().put(
            key,
            StatCacheEntry {
                record: None,
                expiration,
            },
        );
    }

    pub fn erase(&self, name: &str) {
        let key = self.key(name);
        self.shared.lock().pop(&key);
    }

    /// Drops every entry of this scope whose name starts with `prefix`.
    pub fn erase_prefix(&self, prefix: &str) {
        let mut entries = self.shared.lock();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(k, _)| k.scope == self.scope && k.name.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            entries.pop(&key);
        }
    }

    pub fn lookup(&self, name: &str, now: Instant) -> CacheLookup {
        let key = self.key(name);
        let mut entries = self.shared.lock();
        let Some(entry) = entries.get(&key) else {
            return CacheLookup::Miss;
        };
        if entry.expiration < now {
            entries.pop(&key);
            return CacheLookup::Miss;
        }
        match &entry.record {
            Some(record) => CacheLookup::Hit(record.clone()),
            None => CacheLookup::NegativeHit,
        }
    }
}
