//! Folder rename.
//!
//! Hierarchical buckets rename a folder with a single call. Flat buckets copy
//! every object under the source prefix and then delete the sources; the
//! [`RenameProgress`] record tracks how far that got so a failed rename can be
//! resumed. Copies already made are kept, not rolled back.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::cadapter::{Bucket, BucketError, CopyRequest, DeleteRequest, ListRequest};
use crate::context::OpContext;
use crate::error::FsError;
use crate::meta::FastStatBucket;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameProgress {
    pub source_prefix: String,
    pub destination_prefix: String,
    /// Source objects not copied yet, in copy order.
    pub pending: VecDeque<String>,
    /// Source objects copied but not deleted yet.
    pub copied: Vec<String>,
    pub deleted: Vec<String>,
}

impl RenameProgress {
    pub fn new(source_prefix: &str, destination_prefix: &str, mut objects: Vec<String>) -> Self {
        // Parents sort before children, so the destination placeholder is
        // written first and the source placeholder deleted last.
        objects.sort();
        Self {
            source_prefix: source_prefix.to_string(),
            destination_prefix: destination_prefix.to_string(),
            pending: objects.into(),
            copied: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.copied.is_empty()
    }

    /// Whether any remote object was touched yet.
    pub fn has_started(&self) -> bool {
        !self.copied.is_empty() || !self.deleted.is_empty()
    }

    fn destination_for(&self, src: &str) -> String {
        let rest = src.strip_prefix(&self.source_prefix).unwrap_or(src);
        format!("{}{}", self.destination_prefix, rest)
    }
}

pub(crate) async fn rename_folder_hierarchical(
    ctx: &OpContext,
    bucket: &FastStatBucket,
    src_prefix: &str,
    dst_prefix: &str,
) -> Result<(), FsError> {
    debug!(src = src_prefix, dst = dst_prefix, "renaming folder natively");
    bucket.rename_folder(ctx, src_prefix, dst_prefix).await?;
    Ok(())
}

/// Lists the source subtree and builds the progress record for a flat rename.
pub(crate) async fn plan_flat_rename(
    ctx: &OpContext,
    bucket: &FastStatBucket,
    src_prefix: &str,
    dst_prefix: &str,
) -> Result<RenameProgress, FsError> {
    let listing = bucket
        .list_objects(
            ctx,
            ListRequest {
                prefix: src_prefix.to_string(),
                delimiter: None,
            },
        )
        .await?;
    let names = listing.objects.into_iter().map(|o| o.name).collect();
    Ok(RenameProgress::new(src_prefix, dst_prefix, names))
}

/// Drives `progress` to completion: copy every pending object, then delete
/// the copied sources, children before their parents.
pub(crate) async fn run_flat_rename(
    ctx: &OpContext,
    bucket: &FastStatBucket,
    progress: &mut RenameProgress,
) -> Result<(), FsError> {
    while let Some(src) = progress.pending.front().cloned() {
        let dst = progress.destination_for(&src);
        debug!(%src, %dst, "copying object");
        let copied = bucket
            .copy_object(
                ctx,
                CopyRequest {
                    src: src.clone(),
                    dst,
                    ..Default::default()
                },
            )
            .await;
        match copied {
            Ok(_) => {}
            Err(BucketError::NotFound(_)) if !progress.has_started() => {
                return Err(FsError::NotFound(src));
            }
            Err(e) => {
                warn!(%src, error = %e, "copy failed during folder rename");
                return Err(e.into());
            }
        }
        progress.pending.pop_front();
        progress.copied.push(src);
    }

    while let Some(src) = progress.copied.last().cloned() {
        let res = bucket
            .delete_object(
                ctx,
                DeleteRequest {
                    name: src.clone(),
                    ..Default::default()
                },
            )
            .await;
        match res {
            Ok(()) | Err(BucketError::NotFound(_)) => {}
            Err(e) => {
                warn!(%src, error = %e, "delete failed during folder rename");
                return Err(e.into());
            }
        }
        progress.copied.pop();
        progress.deleted.push(src);
    }
    info!(
        src = %progress.source_prefix,
        dst = %progress.destination_prefix,
        objects = progress.deleted.len(),
        "folder rename complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cadapter::BucketType;
    use crate::cadapter::memory::InMemoryBucket;
    use crate::clock::SimulatedClock;
    use crate::meta::SharedStatCache;

    fn setup() -> (Arc<InMemoryBucket>, FastStatBucket) {
        let remote = Arc::new(InMemoryBucket::new("b", BucketType::Flat));
        for name in ["foo/", "foo/file1.txt", "foo/file2.txt", "foo/sub/", "foo/sub/f"] {
            remote.insert_object(name, name);
        }
        let bucket = FastStatBucket::new(
            Duration::from_secs(60),
            SharedStatCache::new(100).view("b"),
            Arc::new(SimulatedClock::new()),
            remote.clone(),
        );
        (remote, bucket)
    }

    #[test]
    fn test_progress_orders_parents_first() {
        let p = RenameProgress::new(
            "a/",
            "b/",
            vec!["a/x".into(), "a/".into(), "a/d/".into(), "a/d/y".into()],
        );
        assert_eq!(p.pending, vec!["a/", "a/d/", "a/d/y", "a/x"]);
        assert_eq!(p.destination_for("a/d/y"), "b/d/y");
        assert!(!p.is_complete());
        assert!(!p.has_started());
    }

    #[tokio::test]
    async fn test_flat_rename_moves_everything() {
        let ctx = OpContext::new();
        let (remote, bucket) = setup();
        let mut progress = plan_flat_rename(&ctx, &bucket, "foo/", "bar/").await.unwrap();
        run_flat_rename(&ctx, &bucket, &mut progress).await.unwrap();
        assert!(progress.is_complete());
        assert_eq!(
            remote.object_names(),
            vec!["bar/", "bar/file1.txt", "bar/file2.txt", "bar/sub/", "bar/sub/f"]
        );
        assert_eq!(remote.contents("bar/file1.txt").unwrap(), "foo/file1.txt");
    }

    #[tokio::test]
    async fn test_failed_copy_can_be_resumed() {
        let ctx = OpContext::new();
        let (remote, bucket) = setup();
        remote.fail_copies_of("foo/file2.txt");
        let mut progress = plan_flat_rename(&ctx, &bucket, "foo/", "bar/").await.unwrap();
        let err = run_flat_rename(&ctx, &bucket, &mut progress)
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Io(_)));
        assert_eq!(progress.copied, vec!["foo/", "foo/file1.txt"]);
        assert_eq!(progress.pending.front().map(String::as_str), Some("foo/file2.txt"));
        // Nothing was deleted yet, so the source is intact.
        assert!(remote.contents("foo/file1.txt").is_some());

        remote.clear_failures();
        run_flat_rename(&ctx, &bucket, &mut progress).await.unwrap();
        assert!(progress.is_complete());
        assert!(remote.object_names().iter().all(|n| n.starts_with("bar/")));
        assert_eq!(progress.deleted.last().map(String::as_str), Some("foo/"));
    }
}
