//! Bucket decorator that answers `stat_object` from the stat cache and keeps
//! the cache coherent with every mutation made through it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::stat_cache::{CacheLookup, StatCacheBucketView};
use crate::cadapter::{
    Bucket, BucketError, BucketType, CopyRequest, CreateRequest, DeleteRequest, Generation,
    ListRequest, Listing, MultiRangeSession, ObjectRecord, RangeRequest, RangeStream,
};
use crate::clock::Clock;
use crate::context::OpContext;

pub struct FastStatBucket {
    ttl: Duration,
    cache: StatCacheBucketView,
    clock: Arc<dyn Clock>,
    wrapped: Arc<dyn Bucket>,
}

impl FastStatBucket {
    pub fn new(
        ttl: Duration,
        cache: StatCacheBucketView,
        clock: Arc<dyn Clock>,
        wrapped: Arc<dyn Bucket>,
    ) -> Self {
        Self {
            ttl,
            cache,
            clock,
            wrapped,
        }
    }

    /// The underlying bucket, for calls that must see remote truth.
    pub fn uncached(&self) -> &Arc<dyn Bucket> {
        &self.wrapped
    }

    pub fn invalidate(&self, name: &str) {
        self.cache.erase(name);
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        self.cache.erase_prefix(prefix);
    }

    fn insert(&self, record: &ObjectRecord) {
        if self.ttl.is_zero() {
            return;
        }
        self.cache
            .insert(record.clone(), self.clock.now() + self.ttl);
    }

    fn insert_negative(&self, name: &str) {
        if self.ttl.is_zero() {
            return;
        }
        self.cache.add_negative_entry(name, self.clock.now() + self.ttl);
    }
}

#[async_trait]
impl Bucket for FastStatBucket {
    fn name(&self) -> &str {
        self.wrapped.name()
    }

    fn bucket_type(&self) -> BucketType {
        self.wrapped.bucket_type()
    }

    async fn stat_object(&self, ctx: &OpContext, name: &str) -> Result<ObjectRecord, BucketError> {
        match self.cache.lookup(name, self.clock.now()) {
            CacheLookup::Hit(record) => {
                trace!(bucket = self.name(), name, "stat cache hit");
                return Ok(record);
            }
            CacheLookup::NegativeHit => {
                trace!(bucket = self.name(), name, "stat cache negative hit");
                return Err(BucketError::NotFound(name.to_string()));
            }
            CacheLookup::Miss => {}
        }
        match self.wrapped.stat_object(ctx, name).await {
            Ok(record) => {
                self.insert(&record);
                Ok(record)
            }
            Err(BucketError::NotFound(n)) => {
                self.insert_negative(name);
                Err(BucketError::NotFound(n))
            }
            Err(e) => Err(e),
        }
    }

    async fn create_object(
        &self,
        ctx: &OpContext,
        req: CreateRequest,
    ) -> Result<ObjectRecord, BucketError> {
        let name = req.name.clone();
        self.cache.erase(&name);
        let record = self.wrapped.create_object(ctx, req).await?;
        self.insert(&record);
        Ok(record)
    }

    async fn copy_object(
        &self,
        ctx: &OpContext,
        req: CopyRequest,
    ) -> Result<ObjectRecord, BucketError> {
        let dst = req.dst.clone();
        self.cache.erase(&dst);
        let record = self.wrapped.copy_object(ctx, req).await?;
        self.insert(&record);
        Ok(record)
    }

    async fn delete_object(&self, ctx: &OpContext, req: DeleteRequest) -> Result<(), BucketError> {
        let name = req.name.clone();
        self.cache.erase(&name);
        let res = self.wrapped.delete_object(ctx, req).await;
        match &res {
            Ok(()) | Err(BucketError::NotFound(_)) => self.insert_negative(&name),
            Err(_) => {}
        }
        res
    }

    async fn list_objects(&self, ctx: &OpContext, req: ListRequest) -> Result<Listing, BucketError> {
        let listing = self.wrapped.list_objects(ctx, req).await?;
        for record in &listing.objects {
            self.insert(record);
        }
        Ok(listing)
    }

    async fn read_range(
        &self,
        ctx: &OpContext,
        req: RangeRequest,
    ) -> Result<RangeStream, BucketError> {
        self.wrapped.read_range(ctx, req).await
    }

    async fn open_multi_range_session(
        &self,
        ctx: &OpContext,
        name: &str,
        generation: Generation,
    ) -> Result<Arc<dyn MultiRangeSession>, BucketError> {
        self.wrapped
            .open_multi_range_session(ctx, name, generation)
            .await
    }

    async fn rename_folder(&self, ctx: &OpContext, src: &str, dst: &str) -> Result<(), BucketError> {
        self.cache.erase_prefix(src);
        self.cache.erase_prefix(dst);
        let res = self.wrapped.rename_folder(ctx, src, dst).await;
        self.cache.erase_prefix(src);
        self.cache.erase_prefix(dst);
        res
    }
}
