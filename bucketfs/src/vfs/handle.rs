//! Open file handles.
//!
//! A handle reads through a [`ReadManager`] pinned to the generation it
//! opened, or from its local write buffer once it has been written to. Dirty
//! content is uploaded on `sync`/`close` after the stale-handle check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::buffer::{LocalWriteBuffer, SizeLimitExceeded};
use super::fs::FsInner;
use super::stale::GenerationToken;
use crate::cadapter::{Bucket, BucketError, CreateRequest, ObjectRecord, RangeRequest};
use crate::context::OpContext;
use crate::error::FsError;
use crate::meta::EntryType;
use crate::reader::{ObjectData, ReadHandleState, ReadManager};

/// Whether the name a handle was opened under still refers to it. Shared by
/// every handle opened on the same name.
#[derive(Debug, Default)]
pub(crate) struct LinkState {
    unlinked: AtomicBool,
}

impl LinkState {
    pub(crate) fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unlinked(&self) {
        self.unlinked.store(true, Ordering::Release);
    }
}

/// A created file that has not been uploaded yet.
#[derive(Debug)]
pub(crate) struct LocalFile {
    size: AtomicU64,
    pub(crate) created: SystemTime,
}

impl LocalFile {
    pub(crate) fn new() -> Self {
        Self {
            size: AtomicU64::new(0),
            created: SystemTime::now(),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }
}

struct HandleState {
    object: Option<ObjectRecord>,
    token: GenerationToken,
    /// Present while the handle has content not yet uploaded.
    buffer: Option<LocalWriteBuffer>,
    reader: Option<ReadManager>,
    local: Option<Arc<LocalFile>>,
    closed: bool,
}

impl HandleState {
    fn ensure_open(&self, name: &str) -> Result<(), FsError> {
        if self.closed {
            Err(FsError::Closed(name.to_string()))
        } else {
            Ok(())
        }
    }

    fn verify(&self, name: &str) -> Result<(), FsError> {
        if self.object.is_none() && self.buffer.is_none() && !self.closed {
            return Err(FsError::InvariantViolation(format!(
                "handle for {name} has neither a remote object nor local content"
            )));
        }
        if let Some(reader) = &self.reader {
            if self.closed {
                return Err(FsError::InvariantViolation(format!(
                    "closed handle for {name} still owns a read manager"
                )));
            }
            reader.verify_invariants()?;
        }
        Ok(())
    }

    fn drop_reader(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.destroy();
        }
    }
}

pub struct FileHandle {
    name: String,
    fs: Arc<FsInner>,
    link: Arc<LinkState>,
    state: Mutex<HandleState>,
}

impl FileHandle {
    pub(crate) fn new_local(
        name: String,
        fs: Arc<FsInner>,
        link: Arc<LinkState>,
        local: Arc<LocalFile>,
    ) -> Self {
        let buffer = LocalWriteBuffer::new(fs.max_file_size);
        Self {
            name,
            fs,
            link,
            state: Mutex::new(HandleState {
                object: None,
                token: GenerationToken::Absent,
                buffer: Some(buffer),
                reader: None,
                local: Some(local),
                closed: false,
            }),
        }
    }

    pub(crate) fn open_object(
        fs: Arc<FsInner>,
        link: Arc<LinkState>,
        object: ObjectRecord,
    ) -> Self {
        Self {
            name: object.name.clone(),
            fs,
            link,
            state: Mutex::new(HandleState {
                token: GenerationToken::At(object.generation),
                object: Some(object),
                buffer: None,
                reader: None,
                local: None,
                closed: false,
            }),
        }
    }

    /// Object name the handle reads and writes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote object backing the handle, if it has been uploaded.
    pub async fn object(&self) -> Option<ObjectRecord> {
        self.state.lock().await.object.clone()
    }

    /// Access statistics of the handle's read manager, once it has one.
    pub async fn read_state(&self) -> Option<ReadHandleState> {
        let state = self.state.lock().await;
        state.reader.as_ref().map(|r| r.handle_state().clone())
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.buffer.is_some()
    }

    pub async fn read_at(
        &self,
        ctx: &OpContext,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<ObjectData, FsError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.ensure_open(&self.name)?;

        if let Some(buffer) = &state.buffer {
            if buf.is_empty() {
                return Ok(ObjectData::default());
            }
            if offset >= buffer.len() {
                return Ok(ObjectData {
                    eof: true,
                    ..Default::default()
                });
            }
            return Ok(ObjectData {
                size: buffer.read_at(offset, buf),
                ..Default::default()
            });
        }

        let Some(object) = &state.object else {
            return Err(FsError::InvariantViolation(format!(
                "handle for {} has nothing to read from",
                self.name
            )));
        };
        let reader = state.reader.get_or_insert_with(|| {
            let bucket: Arc<dyn Bucket> = self.fs.bucket.clone();
            ReadManager::new(
                object.clone(),
                bucket,
                self.fs.content_cache.clone(),
                &self.fs.reader_options,
            )
        });
        let res = reader.read_at(ctx, buf, offset).await;
        state.verify(&self.name)?;
        res
    }

    pub async fn write_at(
        &self,
        ctx: &OpContext,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, FsError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.ensure_open(&self.name)?;
        let buffer = self.load_buffer(ctx, state).await?;
        buffer
            .write_at(offset, data)
            .map_err(|e| self.too_large(e))?;
        let len = buffer.len();
        if let Some(local) = &state.local {
            local.set_size(len);
        }
        state.verify(&self.name)?;
        Ok(data.len())
    }

    pub async fn truncate(&self, ctx: &OpContext, size: u64) -> Result<(), FsError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.ensure_open(&self.name)?;
        let buffer = self.load_buffer(ctx, state).await?;
        buffer.truncate(size).map_err(|e| self.too_large(e))?;
        if let Some(local) = &state.local {
            local.set_size(size);
        }
        state.verify(&self.name)
    }

    /// Uploads dirty content.
    pub async fn sync(&self, ctx: &OpContext) -> Result<(), FsError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.ensure_open(&self.name)?;
        let res = self.flush(ctx, state).await;
        state.verify(&self.name)?;
        res
    }

    /// Uploads dirty content and releases the handle. Closing twice is a no-op.
    pub async fn close(&self, ctx: &OpContext) -> Result<(), FsError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Ok(());
        }
        let res = self.flush(ctx, state).await;
        state.drop_reader();
        if let Some(local) = state.local.take() {
            self.fs.forget_local(&self.name, &local);
        }
        state.closed = true;
        state.verify(&self.name)?;
        res
    }

    pub fn verify_invariants(&self) -> Result<(), FsError> {
        match self.state.try_lock() {
            Ok(state) => state.verify(&self.name),
            // An operation in flight checks on its way out.
            Err(_) => Ok(()),
        }
    }

    /// Panics if an internal invariant of the handle does not hold.
    pub fn check_invariants(&self) {
        if let Err(e) = self.verify_invariants() {
            panic!("{e}");
        }
    }

    async fn load_buffer<'s>(
        &self,
        ctx: &OpContext,
        state: &'s mut HandleState,
    ) -> Result<&'s mut LocalWriteBuffer, FsError> {
        if state.buffer.is_none() {
            let Some(object) = &state.object else {
                return Err(FsError::InvariantViolation(format!(
                    "handle for {} has nothing to write over",
                    self.name
                )));
            };
            let contents = self.download(ctx, object, state.token).await?;
            state.drop_reader();
            state.buffer = Some(LocalWriteBuffer::with_contents(
                contents,
                self.fs.max_file_size,
            ));
        }
        state.buffer.as_mut().ok_or_else(|| {
            FsError::InvariantViolation(format!("write buffer of {} vanished", self.name))
        })
    }

    fn too_large(&self, e: SizeLimitExceeded) -> FsError {
        FsError::FileTooLarge {
            name: self.name.clone(),
            limit: e.limit,
        }
    }

    async fn download(
        &self,
        ctx: &OpContext,
        object: &ObjectRecord,
        token: GenerationToken,
    ) -> Result<Vec<u8>, FsError> {
        let stream = self
            .fs
            .bucket
            .read_range(
                ctx,
                RangeRequest {
                    name: object.name.clone(),
                    generation: object.generation,
                    start: 0,
                    limit: object.size,
                },
            )
            .await;
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(BucketError::NotFound(_)) => {
                return Err(FsError::Stale {
                    name: self.name.clone(),
                    expected: token,
                    actual: None,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let mut contents = Vec::with_capacity(object.size as usize);
        ctx.run(async {
            stream
                .read_to_end(&mut contents)
                .await
                .map_err(|e| FsError::Io(e.to_string()))
        })
        .await?;
        Ok(contents)
    }

    async fn flush(&self, ctx: &OpContext, state: &mut HandleState) -> Result<(), FsError> {
        let Some(buffer) = &state.buffer else {
            return Ok(());
        };
        let unlinked = self.link.is_unlinked();
        self.fs
            .detector
            .check(ctx, &self.name, state.token, unlinked)
            .await?;
        if unlinked {
            // The content now belongs to no name; keep it local.
            return Ok(());
        }

        let contents: Bytes = buffer.to_bytes();
        let uploaded = self
            .fs
            .bucket
            .create_object(
                ctx,
                CreateRequest {
                    name: self.name.clone(),
                    contents,
                    if_generation_match: Some(state.token.precondition()),
                    symlink_target: None,
                },
            )
            .await;
        let record = match uploaded {
            Ok(record) => record,
            Err(BucketError::PreconditionFailed(_)) => {
                return Err(FsError::Stale {
                    name: self.name.clone(),
                    expected: state.token,
                    actual: None,
                });
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            name = %self.name,
            generation = %record.generation,
            size = record.size,
            "uploaded file"
        );
        state.token = GenerationToken::At(record.generation);
        state.object = Some(record);
        state.buffer = None;
        state.drop_reader();
        if let Some(local) = state.local.take() {
            self.fs.forget_local(&self.name, &local);
        }
        self.fs.note_type(&self.name, EntryType::File);
        debug!(name = %self.name, "handle clean");
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.drop_reader();
        // Nothing uploads a created file once its only handle is gone.
        if let Some(local) = state.local.take() {
            self.fs.forget_local(&self.name, &local);
            self.fs.forget_type(&self.name);
            debug!(name = %self.name, "dropped unclosed handle, discarding local file");
        }
    }
}
