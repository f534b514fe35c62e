//! Filesystem facade over a bucket: path resolution, directory operations,
//! file handles and rename.

pub mod buffer;
pub mod demo;
pub mod fs;
pub mod handle;
pub mod rename;
pub mod stale;

pub use fs::{CONFLICT_SUFFIX, DirEntry, FileAttr, Fs, FsBuilder};
pub use handle::FileHandle;
pub use rename::RenameProgress;
pub use stale::{GenerationToken, StaleHandleDetector};
