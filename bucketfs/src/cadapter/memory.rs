//! In-process bucket, used by the demo binary and by tests.
//!
//! Besides the `Bucket` calls it exposes direct mutation helpers that bypass
//! any caching layered on top, call counters, and injectable copy failures.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use super::object::kind_for;
use super::{
    Bucket, BucketError, BucketType, CopyRequest, CreateRequest, DeleteRequest, Generation,
    ListRequest, Listing, MultiRangeSession, ObjectRecord, RangeRequest, RangeStream,
};
use crate::context::OpContext;

#[derive(Debug, Clone)]
struct StoredObject {
    record: ObjectRecord,
    data: Bytes,
}

/// Number of calls received per bucket operation.
#[derive(Debug, Default)]
pub struct BucketStats {
    stat: AtomicUsize,
    create: AtomicUsize,
    copy: AtomicUsize,
    delete: AtomicUsize,
    list: AtomicUsize,
    read_range: AtomicUsize,
    multi_range_open: AtomicUsize,
    rename_folder: AtomicUsize,
}

impl BucketStats {
    pub fn stat_calls(&self) -> usize {
        self.stat.load(Ordering::Relaxed)
    }
    pub fn create_calls(&self) -> usize {
        self.create.load(Ordering::Relaxed)
    }
    pub fn copy_calls(&self) -> usize {
        self.copy.load(Ordering::Relaxed)
    }
    pub fn delete_calls(&self) -> usize {
        self.delete.load(Ordering::Relaxed)
    }
    pub fn list_calls(&self) -> usize {
        self.list.load(Ordering::Relaxed)
    }
    pub fn read_range_calls(&self) -> usize {
        self.read_range.load(Ordering::Relaxed)
    }
    pub fn multi_range_opens(&self) -> usize {
        self.multi_range_open.load(Ordering::Relaxed)
    }
    pub fn rename_folder_calls(&self) -> usize {
        self.rename_folder.load(Ordering::Relaxed)
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct InMemoryBucket {
    name: String,
    bucket_type: BucketType,
    multi_range: bool,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    next_generation: AtomicU64,
    failing_copies: Mutex<HashSet<String>>,
    stats: BucketStats,
}

impl InMemoryBucket {
    pub fn new(name: impl Into<String>, bucket_type: BucketType) -> Self {
        Self {
            name: name.into(),
            bucket_type,
            multi_range: true,
            objects: Mutex::new(BTreeMap::new()),
            next_generation: AtomicU64::new(1),
            failing_copies: Mutex::new(HashSet::new()),
            stats: BucketStats::default(),
        }
    }

    /// Makes `open_multi_range_session` report `Unsupported`.
    pub fn without_multi_range(mut self) -> Self {
        self.multi_range = false;
        self
    }

    pub fn stats(&self) -> &BucketStats {
        &self.stats
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failing_copies(&self) -> MutexGuard<'_, HashSet<String>> {
        self.failing_copies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn store(
        objects: &mut BTreeMap<String, StoredObject>,
        generation: Generation,
        name: &str,
        data: Bytes,
        symlink_target: Option<String>,
    ) -> ObjectRecord {
        let record = ObjectRecord {
            name: name.to_string(),
            generation,
            size: data.len() as u64,
            updated: SystemTime::now(),
            kind: kind_for(name, symlink_target.as_deref()),
            symlink_target,
        };
        objects.insert(
            name.to_string(),
            StoredObject {
                record: record.clone(),
                data,
            },
        );
        record
    }

    fn generation(&self) -> Generation {
        Generation(self.next_generation.fetch_add(1, Ordering::Relaxed))
    }

    /// Writes an object directly, as another client of the bucket would.
    pub fn insert_object(&self, name: &str, data: impl Into<Bytes>) -> ObjectRecord {
        let generation = self.generation();
        Self::store(&mut self.objects(), generation, name, data.into(), None)
    }

    /// Deletes an object directly. Returns whether it existed.
    pub fn remove_object(&self, name: &str) -> bool {
        self.objects().remove(name).is_some()
    }

    pub fn contents(&self, name: &str) -> Option<Bytes> {
        self.objects().get(name).map(|o| o.data.clone())
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    /// Makes every copy whose source is `name` fail with a transport error.
    pub fn fail_copies_of(&self, name: &str) {
        self.failing_copies().insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_copies().clear();
    }

    fn check_precondition(
        existing: Option<&StoredObject>,
        name: &str,
        want: Option<Generation>,
    ) -> Result<(), BucketError> {
        let Some(want) = want else {
            return Ok(());
        };
        let current = existing.map(|o| o.record.generation);
        let ok = match current {
            None => want == Generation::ABSENT,
            Some(g) => g == want,
        };
        if ok {
            Ok(())
        } else {
            Err(BucketError::PreconditionFailed(name.to_string()))
        }
    }
}

#[async_trait]
impl Bucket for InMemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn bucket_type(&self) -> BucketType {
        self.bucket_type
    }

    async fn stat_object(&self, ctx: &OpContext, name: &str) -> Result<ObjectRecord, BucketError> {
        bump(&self.stats.stat);
        ctx.check::<BucketError>()?;
        self.objects()
            .get(name)
            .map(|o| o.record.clone())
            .ok_or_else(|| BucketError::NotFound(name.to_string()))
    }

    async fn create_object(
        &self,
        ctx: &OpContext,
        req: CreateRequest,
    ) -> Result<ObjectRecord, BucketError> {
        bump(&self.stats.create);
        ctx.check::<BucketError>()?;
        let mut objects = self.objects();
        Self::check_precondition(objects.get(&req.name), &req.name, req.if_generation_match)?;
        let generation = self.generation();
        Ok(Self::store(
            &mut objects,
            generation,
            &req.name,
            req.contents,
            req.symlink_target,
        ))
    }

    async fn copy_object(
        &self,
        ctx: &OpContext,
        req: CopyRequest,
    ) -> Result<ObjectRecord, BucketError> {
        bump(&self.stats.copy);
        ctx.check::<BucketError>()?;
        if self.failing_copies().contains(&req.src) {
            return Err(BucketError::Transport(format!("injected copy failure for {}", req.src)));
        }
        let mut objects = self.objects();
        let src = objects
            .get(&req.src)
            .cloned()
            .ok_or_else(|| BucketError::NotFound(req.src.clone()))?;
        if req.src_generation.is_some_and(|want| src.record.generation != want) {
            return Err(BucketError::NotFound(req.src.clone()));
        }
        Self::check_precondition(objects.get(&req.dst), &req.dst, req.if_generation_match)?;
        let generation = self.generation();
        Ok(Self::store(
            &mut objects,
            generation,
            &req.dst,
            src.data,
            src.record.symlink_target,
        ))
    }

    async fn delete_object(&self, ctx: &OpContext, req: DeleteRequest) -> Result<(), BucketError> {
        bump(&self.stats.delete);
        ctx.check::<BucketError>()?;
        let mut objects = self.objects();
        let existing = objects
            .get(&req.name)
            .ok_or_else(|| BucketError::NotFound(req.name.clone()))?;
        Self::check_precondition(Some(existing), &req.name, req.if_generation_match)?;
        objects.remove(&req.name);
        Ok(())
    }

    async fn list_objects(&self, ctx: &OpContext, req: ListRequest) -> Result<Listing, BucketError> {
        bump(&self.stats.list);
        ctx.check::<BucketError>()?;
        let objects = self.objects();
        let mut listing = Listing::default();
        let mut prefixes = BTreeSet::new();
        for (name, stored) in objects.range(req.prefix.clone()..) {
            let Some(rest) = name.strip_prefix(req.prefix.as_str()) else {
                break;
            };
            match req.delimiter.and_then(|d| rest.find(d).map(|i| (d, i))) {
                Some((d, i)) => {
                    prefixes.insert(format!("{}{}", req.prefix, &rest[..i + d.len_utf8()]));
                }
                None => listing.objects.push(stored.record.clone()),
            }
        }
        listing.prefixes = prefixes.into_iter().collect();
        Ok(listing)
    }

    async fn read_range(
        &self,
        ctx: &OpContext,
        req: RangeRequest,
    ) -> Result<RangeStream, BucketError> {
        bump(&self.stats.read_range);
        ctx.check::<BucketError>()?;
        let objects = self.objects();
        let stored = objects
            .get(&req.name)
            .filter(|o| o.record.generation == req.generation)
            .ok_or_else(|| BucketError::NotFound(req.name.clone()))?;
        let len = stored.data.len() as u64;
        let start = req.start.min(len);
        let limit = req.limit.min(len).max(start);
        Ok(Box::new(Cursor::new(
            stored.data.slice(start as usize..limit as usize),
        )))
    }

    async fn open_multi_range_session(
        &self,
        ctx: &OpContext,
        name: &str,
        generation: Generation,
    ) -> Result<Arc<dyn MultiRangeSession>, BucketError> {
        if !self.multi_range {
            return Err(BucketError::Unsupported("multi-range session".to_string()));
        }
        bump(&self.stats.multi_range_open);
        ctx.check::<BucketError>()?;
        let objects = self.objects();
        let stored = objects
            .get(name)
            .filter(|o| o.record.generation == generation)
            .ok_or_else(|| BucketError::NotFound(name.to_string()))?;
        Ok(Arc::new(InMemorySession {
            data: stored.data.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn rename_folder(&self, ctx: &OpContext, src: &str, dst: &str) -> Result<(), BucketError> {
        if self.bucket_type != BucketType::Hierarchical {
            return Err(BucketError::Unsupported("folder rename".to_string()));
        }
        bump(&self.stats.rename_folder);
        ctx.check::<BucketError>()?;
        let mut objects = self.objects();
        if !objects.contains_key(src) {
            return Err(BucketError::NotFound(src.to_string()));
        }
        if objects.keys().any(|k| k.starts_with(dst)) {
            return Err(BucketError::PreconditionFailed(dst.to_string()));
        }
        let moved: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(src))
            .cloned()
            .collect();
        for old in moved {
            if let Some(stored) = objects.remove(&old) {
                let new_name = format!("{dst}{}", &old[src.len()..]);
                let generation = self.generation();
                Self::store(
                    &mut objects,
                    generation,
                    &new_name,
                    stored.data,
                    stored.record.symlink_target,
                );
            }
        }
        Ok(())
    }
}

struct InMemorySession {
    data: Bytes,
    closed: AtomicBool,
}

#[async_trait]
impl MultiRangeSession for InMemorySession {
    async fn read_at(
        &self,
        ctx: &OpContext,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, BucketError> {
        ctx.check::<BucketError>()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(BucketError::Transport("session closed".to_string()));
        }
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_generation_preconditions() {
        let ctx = OpContext::new();
        let bucket = InMemoryBucket::new("b", BucketType::Flat);
        let req = CreateRequest {
            name: "foo".into(),
            contents: Bytes::from_static(b"taco"),
            if_generation_match: Some(Generation::ABSENT),
            ..Default::default()
        };
        let first = bucket.create_object(&ctx, req.clone()).await.unwrap();
        assert_eq!(
            bucket.create_object(&ctx, req).await.unwrap_err(),
            BucketError::PreconditionFailed("foo".into())
        );

        let replaced = bucket
            .create_object(
                &ctx,
                CreateRequest {
                    name: "foo".into(),
                    contents: Bytes::from_static(b"burrito"),
                    if_generation_match: Some(first.generation),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(replaced.generation > first.generation);
        assert_eq!(replaced.size, 7);
    }

    #[tokio::test]
    async fn test_list_with_delimiter() {
        let ctx = OpContext::new();
        let bucket = InMemoryBucket::new("b", BucketType::Flat);
        for name in ["foo/", "foo/a", "foo/bar/", "foo/bar/b", "foobar", "zzz"] {
            bucket.insert_object(name, "");
        }
        let listing = bucket
            .list_objects(
                &ctx,
                ListRequest {
                    prefix: "foo/".into(),
                    delimiter: Some('/'),
                },
            )
            .await
            .unwrap();
        let names: Vec<_> = listing.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["foo/", "foo/a"]);
        assert_eq!(listing.prefixes, vec!["foo/bar/".to_string()]);

        let all = bucket
            .list_objects(
                &ctx,
                ListRequest {
                    prefix: "foo/".into(),
                    delimiter: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(all.objects.len(), 4);
    }

    #[tokio::test]
    async fn test_read_range_pins_generation() {
        let ctx = OpContext::new();
        let bucket = InMemoryBucket::new("b", BucketType::Flat);
        let rec = bucket.insert_object("foo", "taco");
        let mut stream = bucket
            .read_range(
                &ctx,
                RangeRequest {
                    name: "foo".into(),
                    generation: rec.generation,
                    start: 1,
                    limit: 3,
                },
            )
            .await
            .unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ac");

        bucket.insert_object("foo", "burrito");
        let err = bucket
            .read_range(
                &ctx,
                RangeRequest {
                    name: "foo".into(),
                    generation: rec.generation,
                    start: 0,
                    limit: 4,
                },
            )
            .await
            .err();
        assert_eq!(err, Some(BucketError::NotFound("foo".into())));
    }

    #[tokio::test]
    async fn test_rename_folder_requires_hierarchical_bucket() {
        let ctx = OpContext::new();
        let flat = InMemoryBucket::new("b", BucketType::Flat);
        flat.insert_object("foo/", "");
        assert!(matches!(
            flat.rename_folder(&ctx, "foo/", "bar/").await,
            Err(BucketError::Unsupported(_))
        ));

        let hns = InMemoryBucket::new("b", BucketType::Hierarchical);
        hns.insert_object("foo/", "");
        hns.insert_object("foo/file1.txt", "abcdef");
        hns.rename_folder(&ctx, "foo/", "bar/").await.unwrap();
        assert_eq!(hns.object_names(), vec!["bar/", "bar/file1.txt"]);
        assert_eq!(hns.stats().rename_folder_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_calls() {
        let ctx = OpContext::new();
        ctx.cancel();
        let bucket = InMemoryBucket::new("b", BucketType::Flat);
        bucket.insert_object("foo", "taco");
        assert_eq!(
            bucket.stat_object(&ctx, "foo").await.unwrap_err(),
            BucketError::Cancelled
        );
    }
}
