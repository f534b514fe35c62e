//! Read path: the strategies able to serve a read of one object generation
//! and the [`manager::ReadManager`] trying them in priority order.

pub mod cache;
pub mod file_cache_reader;
pub mod manager;
pub mod multi_range;
pub mod range_reader;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cadapter::BucketError;
use crate::context::{Cancelled, OpContext};
use crate::error::FsError;

pub use file_cache_reader::FileCacheReader;
pub use manager::{ManagerState, ReadHandleState, ReadManager, ReaderOptions};
pub use multi_range::MultiRangeReader;
pub use range_reader::RangeReader;

pub const MIB: u64 = 1 << 20;

/// Outcome of one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectData {
    /// Bytes written into the caller's buffer.
    pub size: usize,
    pub cache_hit: bool,
    /// The offset was at or past the end of the object.
    pub eof: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    Sequential,
    Random,
}

pub struct ReadRequest<'a> {
    pub offset: u64,
    pub buf: &'a mut [u8],
    pub pattern: AccessPattern,
    /// Mean size of the reads served so far on this handle.
    pub average_read_bytes: u64,
}

#[derive(Debug, Error)]
pub enum ReaderError {
    /// This strategy is not applicable; the next one should be tried.
    #[error("reader cannot serve this request: {0}")]
    CannotServe(&'static str),

    #[error(transparent)]
    Fs(#[from] FsError),
}

impl From<BucketError> for ReaderError {
    fn from(err: BucketError) -> Self {
        ReaderError::Fs(err.into())
    }
}

impl From<Cancelled> for ReaderError {
    fn from(_: Cancelled) -> Self {
        ReaderError::Fs(FsError::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReaderKind {
    FileCache,
    MultiRange,
    Sequential,
}

pub enum Reader {
    FileCache(FileCacheReader),
    MultiRange(MultiRangeReader),
    Sequential(RangeReader),
}

impl Reader {
    pub fn kind(&self) -> ReaderKind {
        match self {
            Reader::FileCache(_) => ReaderKind::FileCache,
            Reader::MultiRange(_) => ReaderKind::MultiRange,
            Reader::Sequential(_) => ReaderKind::Sequential,
        }
    }

    pub async fn read_at(
        &mut self,
        ctx: &OpContext,
        req: ReadRequest<'_>,
    ) -> Result<ObjectData, ReaderError> {
        match self {
            Reader::FileCache(r) => r.read_at(ctx, req).await,
            Reader::MultiRange(r) => r.read_at(ctx, req).await,
            Reader::Sequential(r) => r.read_at(ctx, req).await,
        }
    }

    pub fn verify_invariants(&self) -> Result<(), FsError> {
        match self {
            Reader::FileCache(_) => Ok(()),
            Reader::MultiRange(r) => r.verify_invariants(),
            Reader::Sequential(r) => r.verify_invariants(),
        }
    }

    /// Releases every remote resource held by the reader.
    pub fn destroy(&mut self) {
        match self {
            Reader::FileCache(_) => {}
            Reader::MultiRange(r) => r.destroy(),
            Reader::Sequential(r) => r.destroy(),
        }
    }

    /// Whether the reader currently holds a remote resource.
    pub fn holds_remote_resource(&self) -> bool {
        match self {
            Reader::FileCache(_) => false,
            Reader::MultiRange(r) => r.has_open_session(),
            Reader::Sequential(r) => r.has_open_transport(),
        }
    }
}
