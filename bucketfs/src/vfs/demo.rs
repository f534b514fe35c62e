//! End-to-end walk through the filesystem against an in-memory bucket.

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::info;

use super::Fs;
use crate::cadapter::BucketType;
use crate::cadapter::memory::InMemoryBucket;
use crate::config::MountConfig;
use crate::context::OpContext;

/// Creates a directory and a file, reads the file back, renames the directory
/// and checks the file followed it.
pub async fn e2e_memory_demo(config: MountConfig) -> Result<()> {
    let bucket_type = if config.enable_hns {
        BucketType::Hierarchical
    } else {
        BucketType::Flat
    };
    let remote = Arc::new(InMemoryBucket::new("demo", bucket_type));
    let fs = Fs::builder(remote.clone()).config(config).build();
    let ctx = OpContext::new();

    fs.mkdir(&ctx, "/docs").await?;
    let handle = fs.create(&ctx, "/docs/hello.txt").await?;
    let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    handle.write_at(&ctx, 0, &data).await?;
    handle.close(&ctx).await?;

    if fs.read_file(&ctx, "/docs/hello.txt").await? != data {
        bail!("data mismatch after upload");
    }

    fs.rename(&ctx, "/docs", "/archive").await?;
    if fs.read_file(&ctx, "/archive/hello.txt").await? != data {
        bail!("data mismatch after rename");
    }
    if fs.exists(&ctx, "/docs").await? {
        bail!("source directory still visible after rename");
    }

    info!(objects = ?remote.object_names(), "demo finished");
    Ok(())
}
