//! Directory and file rename on flat and hierarchical buckets.

use std::sync::Arc;

use bucketfs::cadapter::BucketType;
use bucketfs::cadapter::memory::InMemoryBucket;
use bucketfs::config::MountConfig;
use bucketfs::error::Precondition;
use bucketfs::vfs::Fs;
use bucketfs::{FsError, OpContext};

async fn mount(bucket_type: BucketType, enable_hns: bool) -> (Arc<InMemoryBucket>, Fs) {
    let ctx = OpContext::new();
    let remote = Arc::new(InMemoryBucket::new("bucket", bucket_type));
    let fs = Fs::builder(remote.clone())
        .config(MountConfig {
            enable_hns,
            ..Default::default()
        })
        .build();
    fs.mkdir(&ctx, "foo").await.unwrap();
    fs.mkdir(&ctx, "foo/sub").await.unwrap();
    fs.write_file(&ctx, "foo/a", b"taco").await.unwrap();
    fs.write_file(&ctx, "foo/b", b"burrito").await.unwrap();
    fs.write_file(&ctx, "foo/sub/c", b"enchilada").await.unwrap();
    (remote, fs)
}

fn precondition(err: FsError) -> Precondition {
    match err {
        FsError::PreconditionFailed { reason, .. } => reason,
        other => panic!("expected a precondition failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_preconditions_in_order() {
    let ctx = OpContext::new();
    let (remote, fs) = mount(BucketType::Flat, false).await;
    fs.mkdir(&ctx, "full").await.unwrap();
    fs.write_file(&ctx, "full/x", b"x").await.unwrap();
    fs.mkdir(&ctx, "empty").await.unwrap();
    let before = remote.object_names();

    let err = fs.rename(&ctx, "missing", "bar").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!fs.exists(&ctx, "bar").await.unwrap());

    let err = fs.rename(&ctx, "foo", "full").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOTEMPTY);
    assert_eq!(precondition(err), Precondition::DestinationNotEmpty);
    assert_eq!(fs.read_file(&ctx, "foo/a").await.unwrap(), b"taco");
    assert_eq!(fs.read_file(&ctx, "foo/sub/c").await.unwrap(), b"enchilada");
    assert_eq!(fs.read_file(&ctx, "full/x").await.unwrap(), b"x");
    assert!(!fs.exists(&ctx, "full/a").await.unwrap());

    // A non-empty directory renamed onto itself fails the emptiness check first.
    let err = fs.rename(&ctx, "foo", "foo").await.unwrap_err();
    assert_eq!(precondition(err), Precondition::DestinationNotEmpty);

    let err = fs.rename(&ctx, "empty", "empty").await.unwrap_err();
    assert_eq!(precondition(err), Precondition::SamePath);

    let err = fs.rename(&ctx, "foo", "foo/sub/deeper").await.unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
    assert_eq!(precondition(err), Precondition::DestinationInsideSource);

    let err = fs.rename(&ctx, "foo/a", "empty").await.unwrap_err();
    assert!(matches!(err, FsError::IsADirectory(_)));

    let err = fs.rename(&ctx, "empty", "foo/a").await.unwrap_err();
    assert!(matches!(err, FsError::NotADirectory(_)));

    assert_eq!(remote.object_names(), before);
    assert_eq!(remote.stats().copy_calls(), 0);
}

#[tokio::test]
async fn test_hierarchical_rename_is_one_call() {
    let ctx = OpContext::new();
    let (remote, fs) = mount(BucketType::Hierarchical, true).await;
    let copies = remote.stats().copy_calls();

    fs.rename(&ctx, "foo", "bar").await.unwrap();
    assert_eq!(remote.stats().rename_folder_calls(), 1);
    assert_eq!(remote.stats().copy_calls(), copies);

    assert!(!fs.exists(&ctx, "foo").await.unwrap());
    assert!(!fs.exists(&ctx, "foo/a").await.unwrap());
    assert_eq!(fs.read_file(&ctx, "bar/a").await.unwrap(), b"taco");
    assert_eq!(fs.read_file(&ctx, "bar/sub/c").await.unwrap(), b"enchilada");
}

#[tokio::test]
async fn test_hierarchical_rename_onto_empty_directory() {
    let ctx = OpContext::new();
    let (remote, fs) = mount(BucketType::Hierarchical, true).await;
    fs.mkdir(&ctx, "bar").await.unwrap();

    fs.rename(&ctx, "foo", "bar").await.unwrap();
    assert!(remote.object_names().iter().all(|n| n.starts_with("bar/")));
    assert_eq!(fs.read_file(&ctx, "bar/b").await.unwrap(), b"burrito");
}

#[tokio::test]
async fn test_hierarchical_bucket_with_native_rename_disabled() {
    let ctx = OpContext::new();
    let (remote, fs) = mount(BucketType::Hierarchical, false).await;
    fs.rename(&ctx, "foo", "bar").await.unwrap();
    assert_eq!(remote.stats().rename_folder_calls(), 0);
    assert_eq!(remote.stats().copy_calls(), 5);
    assert_eq!(fs.read_file(&ctx, "bar/a").await.unwrap(), b"taco");
}

#[tokio::test]
async fn test_flat_rename_moves_the_subtree() {
    let ctx = OpContext::new();
    let (remote, fs) = mount(BucketType::Flat, true).await;
    fs.rename(&ctx, "/foo/", "/bar").await.unwrap();

    assert_eq!(
        remote.object_names(),
        vec!["bar/", "bar/a", "bar/b", "bar/sub/", "bar/sub/c"]
    );
    let names: Vec<_> = fs
        .readdir(&ctx, "bar")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["a", "b", "sub"]);
    assert!(fs.stat(&ctx, "foo").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_partial_failure_can_be_resumed() {
    let ctx = OpContext::new();
    let (remote, fs) = mount(BucketType::Flat, true).await;
    remote.fail_copies_of("foo/b");

    let err = fs.rename(&ctx, "foo", "bar").await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    let FsError::PartialFailure { progress, cause } = err else {
        panic!("expected a partial failure");
    };
    assert!(matches!(*cause, FsError::Io(_)));
    assert_eq!(progress.copied, vec!["foo/", "foo/a"]);
    assert_eq!(progress.pending.front().map(String::as_str), Some("foo/b"));

    // Nothing was deleted, so the source is still whole.
    assert_eq!(fs.read_file(&ctx, "foo/b").await.unwrap(), b"burrito");

    remote.clear_failures();
    fs.resume_rename(&ctx, *progress).await.unwrap();
    assert!(remote.object_names().iter().all(|n| n.starts_with("bar/")));
    assert_eq!(fs.read_file(&ctx, "bar/b").await.unwrap(), b"burrito");
    assert!(!fs.exists(&ctx, "foo").await.unwrap());
}

#[tokio::test]
async fn test_failure_before_any_copy_is_reported_as_is() {
    let ctx = OpContext::new();
    let (remote, fs) = mount(BucketType::Flat, true).await;
    remote.fail_copies_of("foo/");

    let err = fs.rename(&ctx, "foo", "bar").await.unwrap_err();
    assert!(matches!(err, FsError::Io(_)));
    assert_eq!(remote.object_names().len(), 5);
}

#[tokio::test]
async fn test_file_rename_and_overwrite() {
    let ctx = OpContext::new();
    let (remote, fs) = mount(BucketType::Flat, true).await;

    fs.rename(&ctx, "foo/a", "foo/renamed").await.unwrap();
    assert!(fs.stat(&ctx, "foo/a").await.unwrap_err().is_not_found());
    assert_eq!(fs.read_file(&ctx, "foo/renamed").await.unwrap(), b"taco");

    fs.rename(&ctx, "foo/renamed", "foo/b").await.unwrap();
    assert_eq!(fs.read_file(&ctx, "foo/b").await.unwrap(), b"taco");
    assert!(remote.contents("foo/renamed").is_none());
}

#[tokio::test]
async fn test_unuploaded_file_cannot_be_renamed() {
    let ctx = OpContext::new();
    let (_remote, fs) = mount(BucketType::Flat, true).await;
    let handle = fs.create(&ctx, "foo/new").await.unwrap();
    let err = fs.rename(&ctx, "foo/new", "foo/other").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOTSUP);
    handle.close(&ctx).await.unwrap();
    fs.rename(&ctx, "foo/new", "foo/other").await.unwrap();
}

#[tokio::test]
async fn test_directory_with_unuploaded_files_cannot_be_renamed() {
    for (bucket_type, enable_hns) in [
        (BucketType::Flat, false),
        (BucketType::Hierarchical, true),
    ] {
        let ctx = OpContext::new();
        let (remote, fs) = mount(bucket_type, enable_hns).await;
        let before = remote.object_names();
        let handle = fs.create(&ctx, "foo/sub/new").await.unwrap();
        handle.write_at(&ctx, 0, b"data").await.unwrap();

        let err = fs.rename(&ctx, "foo", "bar").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOTSUP);
        assert_eq!(remote.object_names(), before);
        assert_eq!(remote.stats().rename_folder_calls(), 0);
        assert_eq!(fs.stat(&ctx, "foo/sub/new").await.unwrap().size, 4);
        assert!(!fs.exists(&ctx, "bar").await.unwrap());

        handle.close(&ctx).await.unwrap();
        fs.rename(&ctx, "foo", "bar").await.unwrap();
        assert!(!fs.exists(&ctx, "foo/sub/new").await.unwrap());
        assert_eq!(fs.read_file(&ctx, "bar/sub/new").await.unwrap(), b"data");
        assert!(remote.object_names().iter().all(|n| n.starts_with("bar/")));
    }
}
