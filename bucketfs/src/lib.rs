pub mod cadapter;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod meta;
pub mod reader;
pub mod vfs;

pub use context::OpContext;
pub use error::FsError;
pub use vfs::{Fs, FileHandle};
