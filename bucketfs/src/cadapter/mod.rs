//! Bucket adapters: the remote object store seen by the filesystem core.
//!
//! The trait mirrors the handful of calls the core needs from an object store.
//! Concrete transports live outside this crate; `memory` provides the
//! in-process bucket used by the demo and the tests.

pub mod memory;
pub mod object;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::context::{Cancelled, OpContext};

pub use object::{DIR_SUFFIX, Generation, ObjectKind, ObjectRecord, is_dir_name};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BucketError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("precondition failed for object {0}")]
    PreconditionFailed(String),

    #[error("operation not supported by bucket: {0}")]
    Unsupported(String),

    #[error("bucket call cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<Cancelled> for BucketError {
    fn from(_: Cancelled) -> Self {
        BucketError::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketType {
    /// Keys only; folders are emulated with placeholder objects.
    Flat,
    /// Native folders with atomic folder rename.
    Hierarchical,
}

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    pub contents: Bytes,
    /// `Some(Generation::ABSENT)` means the object must not exist yet.
    pub if_generation_match: Option<Generation>,
    pub symlink_target: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CopyRequest {
    pub src: String,
    pub src_generation: Option<Generation>,
    pub dst: String,
    pub if_generation_match: Option<Generation>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    pub name: String,
    pub if_generation_match: Option<Generation>,
}

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub prefix: String,
    pub delimiter: Option<char>,
}

#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<ObjectRecord>,
    /// Collapsed sub-prefixes, each ending with the delimiter.
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub name: String,
    pub generation: Generation,
    pub start: u64,
    /// Exclusive end offset.
    pub limit: u64,
}

pub type RangeStream = Box<dyn AsyncRead + Send + Unpin>;

/// Long-lived streaming session serving arbitrary ranges of one object.
#[async_trait]
pub trait MultiRangeSession: Send + Sync {
    async fn read_at(
        &self,
        ctx: &OpContext,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, BucketError>;

    fn close(&self);
}

#[async_trait]
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    fn bucket_type(&self) -> BucketType;

    async fn stat_object(&self, ctx: &OpContext, name: &str) -> Result<ObjectRecord, BucketError>;

    async fn create_object(
        &self,
        ctx: &OpContext,
        req: CreateRequest,
    ) -> Result<ObjectRecord, BucketError>;

    async fn copy_object(
        &self,
        ctx: &OpContext,
        req: CopyRequest,
    ) -> Result<ObjectRecord, BucketError>;

    async fn delete_object(&self, ctx: &OpContext, req: DeleteRequest) -> Result<(), BucketError>;

    async fn list_objects(&self, ctx: &OpContext, req: ListRequest) -> Result<Listing, BucketError>;

    async fn read_range(
        &self,
        ctx: &OpContext,
        req: RangeRequest,
    ) -> Result<RangeStream, BucketError>;

    async fn open_multi_range_session(
        &self,
        _ctx: &OpContext,
        _name: &str,
        _generation: Generation,
    ) -> Result<Arc<dyn MultiRangeSession>, BucketError> {
        Err(BucketError::Unsupported("multi-range session".to_string()))
    }

    /// Atomically renames every object under `src` to `dst`.
    /// Both arguments are folder prefixes ending with `/`.
    async fn rename_folder(
        &self,
        _ctx: &OpContext,
        _src: &str,
        _dst: &str,
    ) -> Result<(), BucketError> {
        Err(BucketError::Unsupported("folder rename".to_string()))
    }
}
