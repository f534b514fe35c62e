//! In-memory content of a file being written, kept until it is uploaded.

use bytes::Bytes;
use thiserror::Error;

/// A write or truncate would grow the buffer past its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("file size would exceed the {limit} byte limit")]
pub struct SizeLimitExceeded {
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct LocalWriteBuffer {
    data: Vec<u8>,
    limit: u64,
}

impl LocalWriteBuffer {
    pub fn new(limit: u64) -> Self {
        Self {
            data: Vec::new(),
            limit,
        }
    }

    pub fn with_contents(data: impl Into<Vec<u8>>, limit: u64) -> Self {
        Self {
            data: data.into(),
            limit,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Writes `src` at `offset`; any gap past the current end is zero-filled.
    pub fn write_at(&mut self, offset: u64, src: &[u8]) -> Result<(), SizeLimitExceeded> {
        let end = offset
            .checked_add(src.len() as u64)
            .ok_or(SizeLimitExceeded { limit: self.limit })?;
        let end = self.check_size(end)?;
        let start = end - src.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(src);
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let start = offset as usize;
        if start >= self.data.len() {
            return 0;
        }
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }

    pub fn truncate(&mut self, size: u64) -> Result<(), SizeLimitExceeded> {
        let size = self.check_size(size)?;
        self.data.resize(size, 0);
        Ok(())
    }

    fn check_size(&self, size: u64) -> Result<usize, SizeLimitExceeded> {
        let exceeded = SizeLimitExceeded { limit: self.limit };
        if size > self.limit {
            return Err(exceeded);
        }
        usize::try_from(size).map_err(|_| exceeded)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}
