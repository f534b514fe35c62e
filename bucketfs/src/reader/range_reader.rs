//! Network reader streaming one byte range of the object at a time.
//!
//! Sequential reads open large ranges and keep consuming the same stream;
//! random reads open ranges sized after the handle's average read.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{AccessPattern, MIB, ObjectData, ReadRequest, ReaderError};
use crate::cadapter::{Bucket, ObjectRecord, RangeRequest, RangeStream};
use crate::context::OpContext;
use crate::error::FsError;

const MIN_RANGE_BYTES: u64 = MIB;
/// Forward gaps up to this size are skipped inside the current stream.
const MAX_SKIP_BYTES: u64 = 8 * MIB;

/// An open range stream and the token cancelling its transfer. Dropping it
/// cancels the token, so the pair is always released together.
struct ActiveRange {
    stream: RangeStream,
    cancel: CancellationToken,
    /// Offset of the next byte the stream will yield.
    start: u64,
    /// Exclusive end of the requested range.
    limit: u64,
}

impl Drop for ActiveRange {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum RangeTransport {
    Idle,
    Open(ActiveRange),
}

pub struct RangeReader {
    object: ObjectRecord,
    bucket: Arc<dyn Bucket>,
    sequential_read_size: u64,
    transport: RangeTransport,
}

impl RangeReader {
    pub fn new(object: ObjectRecord, bucket: Arc<dyn Bucket>, sequential_read_size_mb: u32) -> Self {
        Self {
            object,
            bucket,
            sequential_read_size: u64::from(sequential_read_size_mb.max(1)) * MIB,
            transport: RangeTransport::Idle,
        }
    }

    pub fn has_open_transport(&self) -> bool {
        matches!(self.transport, RangeTransport::Open(_))
    }

    fn range_end(&self, offset: u64, want: u64, pattern: AccessPattern, average: u64) -> u64 {
        let len = match pattern {
            AccessPattern::Sequential => self.sequential_read_size,
            AccessPattern::Random => average
                .max(want)
                .clamp(MIN_RANGE_BYTES, self.sequential_read_size),
        };
        offset
            .saturating_add(len.max(want))
            .min(self.object.size)
    }

    /// Takes the current range if it can serve `[offset, offset + want)`,
    /// skipping forward when the gap is small. Anything else is released.
    async fn reusable_range(
        &mut self,
        ctx: &OpContext,
        offset: u64,
        want: u64,
    ) -> Result<Option<ActiveRange>, FsError> {
        let RangeTransport::Open(mut active) =
            std::mem::replace(&mut self.transport, RangeTransport::Idle)
        else {
            return Ok(None);
        };
        let end = offset + want;
        if offset < active.start || end > active.limit {
            trace!(name = %self.object.name, offset, "range does not cover read, reopening");
            return Ok(None);
        }
        let gap = offset - active.start;
        if gap > MAX_SKIP_BYTES {
            trace!(name = %self.object.name, gap, "gap too large to skip, reopening");
            return Ok(None);
        }
        if gap > 0 {
            let skipped = ctx
                .run(async {
                    let mut limited = (&mut active.stream).take(gap);
                    tokio::io::copy(&mut limited, &mut tokio::io::sink())
                        .await
                        .map_err(|e| FsError::Io(e.to_string()))
                })
                .await?;
            if skipped != gap {
                return Ok(None);
            }
            active.start = offset;
        }
        Ok(Some(active))
    }

    pub async fn read_at(
        &mut self,
        ctx: &OpContext,
        req: ReadRequest<'_>,
    ) -> Result<ObjectData, ReaderError> {
        let ReadRequest {
            offset,
            buf,
            pattern,
            average_read_bytes,
        } = req;
        let want = (buf.len() as u64).min(self.object.size.saturating_sub(offset));
        if want == 0 {
            return Ok(ObjectData::default());
        }

        let mut active = match self.reusable_range(ctx, offset, want).await? {
            Some(active) => active,
            None => {
                let limit = self.range_end(offset, want, pattern, average_read_bytes);
                debug!(
                    name = %self.object.name,
                    start = offset,
                    limit,
                    ?pattern,
                    "opening range stream"
                );
                // The stream outlives this request, so its transfer gets its
                // own token rather than a child of the caller's.
                let cancel = CancellationToken::new();
                let range_ctx = OpContext::with_token(cancel.clone());
                let stream = ctx
                    .run(self.bucket.read_range(
                        &range_ctx,
                        RangeRequest {
                            name: self.object.name.clone(),
                            generation: self.object.generation,
                            start: offset,
                            limit,
                        },
                    ))
                    .await;
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        cancel.cancel();
                        return Err(e.into());
                    }
                };
                ActiveRange {
                    stream,
                    cancel,
                    start: offset,
                    limit,
                }
            }
        };

        let dst = &mut buf[..want as usize];
        let n = ctx.run(read_full(&mut active.stream, dst)).await?;
        active.start += n as u64;
        if (n as u64) < want {
            return Err(FsError::Io(format!(
                "range stream for {} ended early at offset {}",
                self.object.name, active.start
            ))
            .into());
        }
        if active.start < active.limit {
            self.transport = RangeTransport::Open(active);
        }
        Ok(ObjectData {
            size: n,
            cache_hit: false,
            eof: false,
        })
    }

    pub fn verify_invariants(&self) -> Result<(), FsError> {
        if let RangeTransport::Open(active) = &self.transport {
            if active.start > active.limit || active.limit > self.object.size {
                return Err(FsError::InvariantViolation(format!(
                    "range [{}, {}) outside object {} of size {}",
                    active.start, active.limit, self.object.name, self.object.size
                )));
            }
            if active.cancel.is_cancelled() {
                return Err(FsError::InvariantViolation(format!(
                    "open range of {} has a cancelled transfer",
                    self.object.name
                )));
            }
        }
        Ok(())
    }

    pub fn destroy(&mut self) {
        self.transport = RangeTransport::Idle;
    }
}

async fn read_full(stream: &mut RangeStream, buf: &mut [u8]) -> Result<usize, FsError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .map_err(|e| FsError::Io(e.to_string()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
