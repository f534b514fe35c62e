//! Error taxonomy shared by the cache layer, the readers and the VFS facade.
//!
//! Every variant maps onto a single errno through [`FsError::errno`], which is
//! what the protocol server replies with.

use std::fmt;

use thiserror::Error;

use crate::cadapter::{BucketError, Generation};
use crate::context::Cancelled;
use crate::vfs::rename::RenameProgress;
use crate::vfs::stale::GenerationToken;

/// Which precondition of a mutating operation did not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Rename destination is a directory that still has children.
    DestinationNotEmpty,
    /// Rename source and destination are the same path.
    SamePath,
    /// Rename destination lives inside the source subtree.
    DestinationInsideSource,
    /// The remote object generation did not match the expected one.
    GenerationMismatch,
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Precondition::DestinationNotEmpty => "destination directory is not empty",
            Precondition::SamePath => "source and destination are the same path",
            Precondition::DestinationInsideSource => "destination is inside the source directory",
            Precondition::GenerationMismatch => "generation does not match",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("stale file handle for {name}: captured generation {expected}, remote generation {actual:?}")]
    Stale {
        name: String,
        expected: GenerationToken,
        actual: Option<Generation>,
    },

    #[error("precondition failed for {name}: {reason}")]
    PreconditionFailed { name: String, reason: Precondition },

    #[error("operation cancelled")]
    Cancelled,

    #[error(
        "rename of {} to {} stopped partway ({} objects left to copy): {cause}",
        .progress.source_prefix,
        .progress.destination_prefix,
        .progress.pending.len()
    )]
    PartialFailure {
        progress: Box<RenameProgress>,
        cause: Box<FsError>,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("file handle is closed: {0}")]
    Closed(String),

    #[error("file too large: {name} may not grow past {limit} bytes")]
    FileTooLarge { name: String, limit: u64 },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl FsError {
    /// Errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            FsError::Stale { .. } => libc::ESTALE,
            FsError::PreconditionFailed { reason, .. } => match reason {
                Precondition::DestinationNotEmpty => libc::ENOTEMPTY,
                Precondition::SamePath | Precondition::DestinationInsideSource => libc::EINVAL,
                Precondition::GenerationMismatch => libc::ESTALE,
            },
            FsError::Cancelled => libc::EINTR,
            FsError::PartialFailure { .. } => libc::EIO,
            FsError::InvariantViolation(_) => libc::EIO,
            FsError::Closed(_) => libc::EBADF,
            FsError::FileTooLarge { .. } => libc::EFBIG,
            FsError::Unsupported(_) => libc::ENOTSUP,
            FsError::Io(_) => libc::EIO,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

impl From<Cancelled> for FsError {
    fn from(_: Cancelled) -> Self {
        FsError::Cancelled
    }
}

impl From<BucketError> for FsError {
    fn from(err: BucketError) -> Self {
        match err {
            BucketError::NotFound(name) => FsError::NotFound(name),
            BucketError::PreconditionFailed(name) => FsError::PreconditionFailed {
                name,
                reason: Precondition::GenerationMismatch,
            },
            BucketError::Unsupported(what) => FsError::Unsupported(what),
            BucketError::Cancelled => FsError::Cancelled,
            BucketError::Transport(msg) => FsError::Io(msg),
        }
    }
}
