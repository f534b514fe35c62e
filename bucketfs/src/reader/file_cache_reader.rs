//! Reader serving bytes from the local content cache, filling it on a miss
//! by downloading the whole object generation.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::cache::{ContentCache, ContentKey, ContentLookup};
use super::{ObjectData, ReadRequest, ReaderError};
use crate::cadapter::{Bucket, ObjectRecord, RangeRequest};
use crate::context::OpContext;
use crate::error::FsError;

pub struct FileCacheReader {
    object: ObjectRecord,
    bucket: Arc<dyn Bucket>,
    cache: Arc<dyn ContentCache>,
    cache_file_for_range_read: bool,
}

impl FileCacheReader {
    pub fn new(
        object: ObjectRecord,
        bucket: Arc<dyn Bucket>,
        cache: Arc<dyn ContentCache>,
        cache_file_for_range_read: bool,
    ) -> Self {
        Self {
            object,
            bucket,
            cache,
            cache_file_for_range_read,
        }
    }

    fn key(&self) -> ContentKey {
        ContentKey {
            name: self.object.name.clone(),
            generation: self.object.generation,
        }
    }

    pub async fn read_at(
        &mut self,
        ctx: &OpContext,
        req: ReadRequest<'_>,
    ) -> Result<ObjectData, ReaderError> {
        let ReadRequest { offset, buf, .. } = req;
        let want = (buf.len() as u64).min(self.object.size.saturating_sub(offset)) as usize;
        let dst = &mut buf[..want];
        let key = self.key();

        match self.cache.get(&key, offset, dst).await {
            ContentLookup::Hit(n) => {
                return Ok(ObjectData {
                    size: n,
                    cache_hit: true,
                    eof: false,
                });
            }
            ContentLookup::GenerationMismatch { cached } => {
                debug!(
                    name = %key.name,
                    cached = %cached,
                    current = %key.generation,
                    "evicting cached content of another generation"
                );
                self.cache.invalidate(&key.name).await;
            }
            ContentLookup::Miss => {}
        }

        if offset != 0 && !self.cache_file_for_range_read {
            return Err(ReaderError::CannotServe("range read of an uncached object"));
        }
        if self.object.size > self.cache.capacity_bytes() {
            return Err(ReaderError::CannotServe("object larger than the content cache"));
        }

        let data = self.download(ctx).await?;
        let start = offset as usize;
        dst.copy_from_slice(&data[start..start + want]);
        self.cache.put(key, 0, data).await;
        Ok(ObjectData {
            size: want,
            cache_hit: false,
            eof: false,
        })
    }

    async fn download(&self, ctx: &OpContext) -> Result<Bytes, ReaderError> {
        debug!(name = %self.object.name, size = self.object.size, "populating content cache");
        let mut stream = ctx
            .run(self.bucket.read_range(
                ctx,
                RangeRequest {
                    name: self.object.name.clone(),
                    generation: self.object.generation,
                    start: 0,
                    limit: self.object.size,
                },
            ))
            .await?;
        let mut data = Vec::with_capacity(self.object.size as usize);
        ctx.run(async {
            stream
                .read_to_end(&mut data)
                .await
                .map_err(|e| FsError::Io(e.to_string()))
        })
        .await?;
        if data.len() as u64 != self.object.size {
            return Err(FsError::Io(format!(
                "downloaded {} bytes of {}, expected {}",
                data.len(),
                self.object.name,
                self.object.size
            ))
            .into());
        }
        Ok(Bytes::from(data))
    }
}
