//! Random-access reader backed by one long-lived multi-range session.
//!
//! The session is opened on the first random read and then shared by every
//! later read of the handle. Buckets without session support leave the slot
//! `Unavailable` and the reader steps aside for good.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AccessPattern, ObjectData, ReadRequest, ReaderError};
use crate::cadapter::{Bucket, BucketError, MultiRangeSession, ObjectRecord};
use crate::context::OpContext;
use crate::error::FsError;

/// An open session and the token of its background transfer. Dropping it
/// closes the session and cancels the token together.
struct OpenSession {
    session: Arc<dyn MultiRangeSession>,
    cancel: CancellationToken,
}

impl Drop for OpenSession {
    fn drop(&mut self) {
        self.session.close();
        self.cancel.cancel();
    }
}

enum SessionSlot {
    Unopened,
    /// The bucket cannot serve multi-range sessions.
    Unavailable,
    Open(OpenSession),
}

pub struct MultiRangeReader {
    object: ObjectRecord,
    bucket: Arc<dyn Bucket>,
    slot: SessionSlot,
}

impl MultiRangeReader {
    pub fn new(object: ObjectRecord, bucket: Arc<dyn Bucket>) -> Self {
        Self {
            object,
            bucket,
            slot: SessionSlot::Unopened,
        }
    }

    pub fn has_open_session(&self) -> bool {
        matches!(self.slot, SessionSlot::Open(_))
    }

    async fn open(&mut self, ctx: &OpContext) -> Result<(), ReaderError> {
        let cancel = CancellationToken::new();
        let session_ctx = OpContext::with_token(cancel.clone());
        let opened = ctx
            .run(self.bucket.open_multi_range_session(
                &session_ctx,
                &self.object.name,
                self.object.generation,
            ))
            .await;
        match opened {
            Ok(session) => {
                debug!(name = %self.object.name, "opened multi-range session");
                self.slot = SessionSlot::Open(OpenSession { session, cancel });
                Ok(())
            }
            Err(BucketError::Unsupported(what)) => {
                debug!(name = %self.object.name, %what, "multi-range reads unavailable");
                cancel.cancel();
                self.slot = SessionSlot::Unavailable;
                Err(ReaderError::CannotServe("bucket has no multi-range sessions"))
            }
            Err(e) => {
                cancel.cancel();
                Err(e.into())
            }
        }
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
            ..
        } = req;
        if pattern == AccessPattern::Sequential {
            return Err(ReaderError::CannotServe("sequential reads use range streams"));
        }
        if matches!(self.slot, SessionSlot::Unavailable) {
            return Err(ReaderError::CannotServe("bucket has no multi-range sessions"));
        }
        if matches!(self.slot, SessionSlot::Unopened) {
            self.open(ctx).await?;
        }
        let SessionSlot::Open(open) = &self.slot else {
            return Err(FsError::InvariantViolation(format!(
                "multi-range session of {} missing after open",
                self.object.name
            ))
            .into());
        };

        let want = (buf.len() as u64).min(self.object.size.saturating_sub(offset));
        let dst = &mut buf[..want as usize];
        let session = Arc::clone(&open.session);
        match ctx.run(session.read_at(ctx, offset, dst)).await {
            Ok(n) => Ok(ObjectData {
                size: n,
                cache_hit: false,
                eof: false,
            }),
            Err(e) => {
                if e != BucketError::Cancelled {
                    warn!(name = %self.object.name, offset, error = %e, "multi-range read failed");
                }
                // A session interrupted mid-transfer is not reused.
                self.slot = SessionSlot::Unopened;
                Err(e.into())
            }
        }
    }

    pub fn verify_invariants(&self) -> Result<(), FsError> {
        match &self.slot {
            SessionSlot::Open(open) if open.cancel.is_cancelled() => {
                Err(FsError::InvariantViolation(format!(
                    "open multi-range session of {} has a cancelled transfer",
                    self.object.name
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn destroy(&mut self) {
        if matches!(self.slot, SessionSlot::Open(_)) {
            self.slot = SessionSlot::Unopened;
        }
    }
}
