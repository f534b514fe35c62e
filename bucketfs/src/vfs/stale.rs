//! Detection of handles whose backing object was replaced by another writer.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cadapter::{Bucket, BucketError, Generation};
use crate::context::OpContext;
use crate::error::FsError;

/// Generation a handle expects the remote object to still have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationToken {
    /// New local file: no remote object may exist under its name.
    Absent,
    At(Generation),
}

impl GenerationToken {
    /// Generation precondition for uploading over the expected object.
    pub fn precondition(self) -> Generation {
        match self {
            GenerationToken::Absent => Generation::ABSENT,
            GenerationToken::At(g) => g,
        }
    }
}

impl fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationToken::Absent => f.write_str("none"),
            GenerationToken::At(g) => write!(f, "{g}"),
        }
    }
}

pub struct StaleHandleDetector {
    /// Must not be the caching bucket: the stat cache may itself be stale.
    bucket: Arc<dyn Bucket>,
}

impl StaleHandleDetector {
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self { bucket }
    }

    /// Fails with `FsError::Stale` when the remote object no longer matches
    /// `token`. Unlinked handles are never stale.
    pub async fn check(
        &self,
        ctx: &OpContext,
        name: &str,
        token: GenerationToken,
        unlinked: bool,
    ) -> Result<(), FsError> {
        if unlinked {
            debug!(name, "handle unlinked, skipping staleness check");
            return Ok(());
        }
        let live = match self.bucket.stat_object(ctx, name).await {
            Ok(record) => Some(record.generation),
            Err(BucketError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        match (token, live) {
            (GenerationToken::Absent, None) => Ok(()),
            (GenerationToken::At(want), Some(got)) if want == got => Ok(()),
            (expected, actual) => {
                warn!(name, %expected, ?actual, "stale file handle");
                Err(FsError::Stale {
                    name: name.to_string(),
                    expected,
                    actual,
                })
            }
        }
    }
}
