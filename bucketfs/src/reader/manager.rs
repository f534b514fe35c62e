//! Per-handle read manager.
//!
//! Owns the strategies applicable to one object generation and the access
//! statistics of the handle. A read walks the strategies in priority order
//! until one serves it.

use std::sync::Arc;

use tracing::{trace, warn};

use super::cache::ContentCache;
use super::{
    AccessPattern, FileCacheReader, MultiRangeReader, ObjectData, RangeReader, ReadRequest, Reader,
    ReaderError, ReaderKind,
};
use crate::cadapter::{Bucket, ObjectRecord};
use crate::config::MountConfig;
use crate::context::OpContext;
use crate::error::FsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Unopened,
    Active,
    Destroyed,
}

/// Strategy selection and tuning derived from the mount config.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub priority: Vec<ReaderKind>,
    pub sequential_read_size_mb: u32,
    pub random_seek_threshold: u32,
    pub enable_multi_range: bool,
    pub cache_file_for_range_read: bool,
}

impl ReaderOptions {
    pub fn from_config(config: &MountConfig) -> Self {
        Self {
            priority: config.read.reader_priority.clone(),
            sequential_read_size_mb: config.read.sequential_read_size_mb,
            random_seek_threshold: config.read.random_seek_threshold,
            enable_multi_range: config.read.enable_multi_range,
            cache_file_for_range_read: config.file_cache.cache_file_for_range_read,
        }
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self::from_config(&MountConfig::default())
    }
}

/// Access statistics of one handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadHandleState {
    /// Offset a contiguous next read would start at.
    pub expected_offset: u64,
    pub seeks: u32,
    pub reads: u64,
    pub total_read_bytes: u64,
}

impl ReadHandleState {
    fn observe(&mut self, offset: u64) {
        if self.reads > 0 && offset != self.expected_offset {
            self.seeks = self.seeks.saturating_add(1);
        }
    }

    fn record(&mut self, offset: u64, n: usize) {
        self.reads += 1;
        self.total_read_bytes += n as u64;
        self.expected_offset = offset + n as u64;
    }

    pub fn pattern(&self, seek_threshold: u32) -> AccessPattern {
        if self.seeks >= seek_threshold {
            AccessPattern::Random
        } else {
            AccessPattern::Sequential
        }
    }

    pub fn average_read_bytes(&self) -> u64 {
        self.total_read_bytes.checked_div(self.reads).unwrap_or(0)
    }
}

pub struct ReadManager {
    object: ObjectRecord,
    readers: Vec<Reader>,
    state: ManagerState,
    handle: ReadHandleState,
    seek_threshold: u32,
}

impl ReadManager {
    pub fn new(
        object: ObjectRecord,
        bucket: Arc<dyn Bucket>,
        content_cache: Option<Arc<dyn ContentCache>>,
        opts: &ReaderOptions,
    ) -> Self {
        let mut readers = Vec::with_capacity(opts.priority.len());
        for kind in &opts.priority {
            match kind {
                ReaderKind::FileCache => {
                    if let Some(cache) = &content_cache {
                        readers.push(Reader::FileCache(FileCacheReader::new(
                            object.clone(),
                            Arc::clone(&bucket),
                            Arc::clone(cache),
                            opts.cache_file_for_range_read,
                        )));
                    }
                }
                ReaderKind::MultiRange => {
                    if opts.enable_multi_range {
                        readers.push(Reader::MultiRange(MultiRangeReader::new(
                            object.clone(),
                            Arc::clone(&bucket),
                        )));
                    }
                }
                ReaderKind::Sequential => {
                    readers.push(Reader::Sequential(RangeReader::new(
                        object.clone(),
                        Arc::clone(&bucket),
                        opts.sequential_read_size_mb,
                    )));
                }
            }
        }
        Self::with_readers(object, readers, opts.random_seek_threshold)
    }

    pub fn with_readers(object: ObjectRecord, readers: Vec<Reader>, seek_threshold: u32) -> Self {
        Self {
            object,
            readers,
            state: ManagerState::Unopened,
            handle: ReadHandleState::default(),
            seek_threshold,
        }
    }

    pub fn object(&self) -> &ObjectRecord {
        &self.object
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn handle_state(&self) -> &ReadHandleState {
        &self.handle
    }

    pub fn reader_kinds(&self) -> Vec<ReaderKind> {
        self.readers.iter().map(Reader::kind).collect()
    }

    /// Reads into `buf` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics when called after [`ReadManager::destroy`].
    pub async fn read_at(
        &mut self,
        ctx: &OpContext,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<ObjectData, FsError> {
        match self.state {
            ManagerState::Destroyed => {
                panic!("read_at on destroyed read manager for {}", self.object.name)
            }
            ManagerState::Unopened => self.state = ManagerState::Active,
            ManagerState::Active => {}
        }
        if buf.is_empty() {
            return Ok(ObjectData::default());
        }
        if offset >= self.object.size {
            return Ok(ObjectData {
                eof: true,
                ..Default::default()
            });
        }

        self.handle.observe(offset);
        let pattern = self.handle.pattern(self.seek_threshold);
        let average_read_bytes = self.handle.average_read_bytes();
        let mut last_err = None;
        for reader in &mut self.readers {
            let req = ReadRequest {
                offset,
                buf: &mut *buf,
                pattern,
                average_read_bytes,
            };
            match reader.read_at(ctx, req).await {
                Ok(data) => {
                    trace!(
                        name = %self.object.name,
                        offset,
                        size = data.size,
                        reader = ?reader.kind(),
                        cache_hit = data.cache_hit,
                        "read served"
                    );
                    self.handle.record(offset, data.size);
                    self.check_invariants();
                    return Ok(data);
                }
                Err(ReaderError::CannotServe(why)) => {
                    trace!(name = %self.object.name, reader = ?reader.kind(), why, "reader declined");
                }
                Err(ReaderError::Fs(FsError::Cancelled)) => {
                    self.check_invariants();
                    return Err(FsError::Cancelled);
                }
                Err(ReaderError::Fs(e)) => {
                    warn!(
                        name = %self.object.name,
                        offset,
                        reader = ?reader.kind(),
                        error = %e,
                        "reader failed, trying next"
                    );
                    last_err = Some(e);
                }
            }
        }
        self.check_invariants();
        Err(last_err.unwrap_or_else(|| {
            FsError::Io(format!(
                "no reader could serve {} at offset {offset}",
                self.object.name
            ))
        }))
    }

    pub fn verify_invariants(&self) -> Result<(), FsError> {
        for reader in &self.readers {
            reader.verify_invariants()?;
            if self.state == ManagerState::Destroyed && reader.holds_remote_resource() {
                return Err(FsError::InvariantViolation(format!(
                    "destroyed read manager for {} still holds a {:?} resource",
                    self.object.name,
                    reader.kind()
                )));
            }
        }
        Ok(())
    }

    /// Panics if an internal invariant does not hold.
    pub fn check_invariants(&self) {
        if let Err(e) = self.verify_invariants() {
            panic!("{e}");
        }
    }

    /// Releases every reader. Calling it again is a no-op.
    pub fn destroy(&mut self) {
        if self.state == ManagerState::Destroyed {
            return;
        }
        for reader in &mut self.readers {
            reader.destroy();
        }
        self.state = ManagerState::Destroyed;
    }
}

impl Drop for ReadManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
