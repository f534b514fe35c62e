//! Local content cache keyed by object name and generation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use moka::ops::compute::Op;

use crate::cadapter::Generation;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub name: String,
    pub generation: Generation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLookup {
    /// The whole requested range was copied out of the cache.
    Hit(usize),
    Miss,
    /// The cache holds bytes for a different generation of the name.
    GenerationMismatch { cached: Generation },
}

#[async_trait]
pub trait ContentCache: Send + Sync {
    async fn get(&self, key: &ContentKey, offset: u64, buf: &mut [u8]) -> ContentLookup;

    /// Stores `data` at `offset`. Bytes held for another generation of the
    /// same name are discarded.
    async fn put(&self, key: ContentKey, offset: u64, data: Bytes);

    async fn invalidate(&self, name: &str);

    fn capacity_bytes(&self) -> u64;
}

#[derive(Debug)]
struct CachedContent {
    generation: Generation,
    extents: BTreeMap<u64, Bytes>,
}

impl CachedContent {
    fn weight(&self) -> u32 {
        let total: usize = self.extents.values().map(Bytes::len).sum();
        u32::try_from(total).unwrap_or(u32::MAX)
    }

    fn copy_out(&self, offset: u64, buf: &mut [u8]) -> Option<usize> {
        let (start, data) = self.extents.range(..=offset).next_back()?;
        let skip = usize::try_from(offset - start).ok()?;
        let end = skip.checked_add(buf.len())?;
        if end > data.len() {
            return None;
        }
        buf.copy_from_slice(&data[skip..end]);
        Some(buf.len())
    }
}

/// In-memory [`ContentCache`] bounded by total cached bytes.
pub struct MemoryContentCache {
    capacity: u64,
    entries: Cache<String, Arc<CachedContent>>,
}

impl MemoryContentCache {
    pub fn new(capacity_bytes: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|_name: &String, content: &Arc<CachedContent>| content.weight())
            .build();
        Self {
            capacity: capacity_bytes,
            entries,
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.get(name).await.is_some()
    }
}

#[async_trait]
impl ContentCache for MemoryContentCache {
    async fn get(&self, key: &ContentKey, offset: u64, buf: &mut [u8]) -> ContentLookup {
        let Some(content) = self.entries.get(&key.name).await else {
            return ContentLookup::Miss;
        };
        if content.generation != key.generation {
            return ContentLookup::GenerationMismatch {
                cached: content.generation,
            };
        }
        match content.copy_out(offset, buf) {
            Some(n) => ContentLookup::Hit(n),
            None => ContentLookup::Miss,
        }
    }

    async fn put(&self, key: ContentKey, offset: u64, data: Bytes) {
        let ContentKey { name, generation } = key;
        self.entries
            .entry(name)
            .and_compute_with(|existing| {
                let mut extents = match existing {
                    Some(entry) if entry.value().generation == generation => {
                        entry.value().extents.clone()
                    }
                    _ => BTreeMap::new(),
                };
                extents.insert(offset, data);
                std::future::ready(Op::Put(Arc::new(CachedContent {
                    generation,
                    extents,
                })))
            })
            .await;
    }

    async fn invalidate(&self, name: &str) {
        self.entries.invalidate(name).await;
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }
}
