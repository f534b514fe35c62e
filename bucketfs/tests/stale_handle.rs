//! Handles whose object was replaced, deleted or renamed underneath them.

use std::sync::Arc;

use bucketfs::cadapter::BucketType;
use bucketfs::cadapter::memory::InMemoryBucket;
use bucketfs::vfs::Fs;
use bucketfs::{FsError, OpContext};

fn mount() -> (Arc<InMemoryBucket>, Fs) {
    let remote = Arc::new(InMemoryBucket::new("bucket", BucketType::Flat));
    let fs = Fs::builder(remote.clone()).build();
    (remote, fs)
}

#[tokio::test]
async fn test_clobbered_object_makes_dirty_handle_stale() {
    let ctx = OpContext::new();
    let (remote, fs) = mount();
    fs.write_file(&ctx, "foo", b"taco").await.unwrap();

    let handle = fs.open(&ctx, "foo").await.unwrap();
    handle.write_at(&ctx, 0, b"burrito").await.unwrap();
    remote.insert_object("foo", "clobber");

    let err = handle.sync(&ctx).await.unwrap_err();
    assert_eq!(err.errno(), libc::ESTALE);
    let err = handle.close(&ctx).await.unwrap_err();
    assert!(matches!(err, FsError::Stale { actual: Some(_), .. }));
    assert_eq!(remote.contents("foo").unwrap(), "clobber");
}

#[tokio::test]
async fn test_write_after_clobber_is_stale() {
    let ctx = OpContext::new();
    let (remote, fs) = mount();
    fs.write_file(&ctx, "foo", b"taco").await.unwrap();

    let handle = fs.open(&ctx, "foo").await.unwrap();
    remote.insert_object("foo", "clobber");
    let err = handle.write_at(&ctx, 0, b"x").await.unwrap_err();
    assert_eq!(err.errno(), libc::ESTALE);
    handle.check_invariants();
}

#[tokio::test]
async fn test_clean_handle_closes_despite_clobber() {
    let ctx = OpContext::new();
    let (remote, fs) = mount();
    fs.write_file(&ctx, "foo", b"taco").await.unwrap();

    let handle = fs.open(&ctx, "foo").await.unwrap();
    let mut buf = [0u8; 4];
    handle.read_at(&ctx, &mut buf, 0).await.unwrap();
    remote.insert_object("foo", "clobber");
    assert!(!handle.is_dirty().await);
    handle.close(&ctx).await.unwrap();
    assert_eq!(&buf, b"taco");
}

#[tokio::test]
async fn test_remote_create_makes_new_file_stale() {
    let ctx = OpContext::new();
    let (remote, fs) = mount();
    let handle = fs.create(&ctx, "foo").await.unwrap();
    handle.write_at(&ctx, 0, b"taco").await.unwrap();
    remote.insert_object("foo", "clobber");

    let err = handle.close(&ctx).await.unwrap_err();
    assert!(matches!(err, FsError::Stale { actual: Some(_), .. }));
    assert_eq!(remote.contents("foo").unwrap(), "clobber");
}

#[tokio::test]
async fn test_unlinked_handle_is_never_stale() {
    let ctx = OpContext::new();
    let (remote, fs) = mount();
    fs.write_file(&ctx, "foo", b"taco").await.unwrap();

    let handle = fs.open(&ctx, "foo").await.unwrap();
    handle.write_at(&ctx, 0, b"burrito").await.unwrap();
    fs.unlink(&ctx, "foo").await.unwrap();

    assert_eq!(handle.write_at(&ctx, 7, b"s").await.unwrap(), 1);
    let mut buf = [0u8; 8];
    handle.read_at(&ctx, &mut buf, 0).await.unwrap();
    assert_eq!(&buf, b"burritos");

    handle.sync(&ctx).await.unwrap();
    assert!(handle.is_dirty().await);
    handle.close(&ctx).await.unwrap();
    assert!(remote.contents("foo").is_none());
}

#[tokio::test]
async fn test_created_file_written_after_unlink_closes_cleanly() {
    let ctx = OpContext::new();
    let (remote, fs) = mount();
    let handle = fs.create(&ctx, "foo").await.unwrap();
    handle.write_at(&ctx, 0, b"line 1\n").await.unwrap();
    fs.unlink(&ctx, "foo").await.unwrap();
    assert!(!fs.exists(&ctx, "foo").await.unwrap());

    handle.write_at(&ctx, 7, b"line 2\n").await.unwrap();
    handle.sync(&ctx).await.unwrap();
    handle.close(&ctx).await.unwrap();
    assert!(remote.contents("foo").is_none());
    assert_eq!(remote.stats().create_calls(), 0);
}

#[tokio::test]
async fn test_renamed_away_handle_does_not_upload() {
    let ctx = OpContext::new();
    let (remote, fs) = mount();
    fs.write_file(&ctx, "foo", b"taco").await.unwrap();

    let handle = fs.open(&ctx, "foo").await.unwrap();
    handle.write_at(&ctx, 0, b"burrito").await.unwrap();
    fs.rename(&ctx, "foo", "bar").await.unwrap();

    handle.close(&ctx).await.unwrap();
    assert!(remote.contents("foo").is_none());
    assert_eq!(remote.contents("bar").unwrap(), "taco");
}

#[tokio::test]
async fn test_successful_sync_refreshes_the_token() {
    let ctx = OpContext::new();
    let (remote, fs) = mount();
    let handle = fs.create(&ctx, "foo").await.unwrap();
    handle.write_at(&ctx, 0, b"taco").await.unwrap();
    handle.sync(&ctx).await.unwrap();
    let first = handle.object().await.unwrap().generation;

    handle.write_at(&ctx, 4, b"s").await.unwrap();
    handle.sync(&ctx).await.unwrap();
    assert!(handle.object().await.unwrap().generation > first);
    handle.close(&ctx).await.unwrap();
    assert_eq!(remote.contents("foo").unwrap(), "tacos");
}
