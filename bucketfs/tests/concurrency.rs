//! Parallel reads through one handle and parallel use of one stat cache.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bucketfs::OpContext;
use bucketfs::cadapter::memory::InMemoryBucket;
use bucketfs::cadapter::{BucketType, Generation, ObjectKind, ObjectRecord};
use bucketfs::config::{MountConfig, ReadConfig};
use bucketfs::meta::{CacheLookup, SharedStatCache};
use bucketfs::reader::ReaderKind;
use bucketfs::vfs::Fs;

const SIZE: usize = 512 * 1024;
const CHUNK: usize = 4096;
const READS: usize = 64;

fn blob() -> Vec<u8> {
    (0..SIZE).map(|i| (i % 251) as u8).collect()
}

async fn read_in_parallel(read: ReadConfig) -> Arc<InMemoryBucket> {
    let ctx = OpContext::new();
    let remote = Arc::new(InMemoryBucket::new("bucket", BucketType::Flat));
    let data = Arc::new(blob());
    remote.insert_object("blob", data.to_vec());
    let fs = Fs::builder(remote.clone())
        .config(MountConfig {
            read,
            ..Default::default()
        })
        .build();
    let handle = Arc::new(fs.open(&ctx, "blob").await.unwrap());

    let mut tasks = Vec::with_capacity(READS);
    for i in 0..READS {
        let handle = Arc::clone(&handle);
        let data = Arc::clone(&data);
        // Half the tasks walk forward, the rest jump around the object.
        let offset = if i % 2 == 0 {
            i * CHUNK
        } else {
            (i * 7919 * CHUNK) % (SIZE - CHUNK)
        };
        tasks.push(tokio::spawn(async move {
            let ctx = OpContext::new();
            let mut buf = vec![0u8; CHUNK];
            let got = handle.read_at(&ctx, &mut buf, offset as u64).await.unwrap();
            assert_eq!(got.size, CHUNK);
            assert_eq!(buf, data[offset..offset + CHUNK]);
            handle.check_invariants();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let state = handle.read_state().await.unwrap();
    assert_eq!(state.reads, READS as u64);
    assert_eq!(state.total_read_bytes, (READS * CHUNK) as u64);
    handle.check_invariants();
    handle.close(&ctx).await.unwrap();
    handle.check_invariants();
    remote
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_reads_through_sequential_reader() {
    let remote = read_in_parallel(ReadConfig {
        reader_priority: vec![ReaderKind::Sequential],
        ..Default::default()
    })
    .await;
    assert_eq!(remote.stats().multi_range_opens(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_reads_through_multi_range_reader() {
    let remote = read_in_parallel(ReadConfig {
        enable_multi_range: true,
        reader_priority: vec![ReaderKind::MultiRange, ReaderKind::Sequential],
        ..Default::default()
    })
    .await;
    // Scattered reads turn the handle random, and one session serves them all.
    assert_eq!(remote.stats().multi_range_opens(), 1);
}

fn record(name: &str, generation: u64) -> ObjectRecord {
    ObjectRecord {
        name: name.to_string(),
        generation: Generation(generation),
        size: generation,
        updated: SystemTime::now(),
        kind: ObjectKind::Regular,
        symlink_target: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_stat_cache_use_stays_consistent() {
    const WRITERS: u64 = 8;
    const ROUNDS: u64 = 200;

    let cache = SharedStatCache::new(1000);
    let view = cache.view("bucket");
    let other = cache.view("other");
    let now = Instant::now();
    let expiration = now + Duration::from_secs(600);

    let mut tasks = Vec::new();
    for w in 0..WRITERS {
        let view = view.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..ROUNDS {
                let generation = round * WRITERS + w + 1;
                view.insert(record("shared", generation), expiration);
                view.insert(record(&format!("own-{w}"), generation), expiration);
                view.add_negative_entry(&format!("gone-{w}"), expiration);
                if round % 10 == 0 {
                    view.erase(&format!("gone-{w}"));
                }
                // Whatever another writer did, a hit is a well-formed record.
                if let CacheLookup::Hit(hit) = view.lookup("shared", now) {
                    assert_eq!(hit.name, "shared");
                    assert_eq!(hit.size, hit.generation.0);
                }
            }
        }));
    }
    let reader_view = view.clone();
    tasks.push(tokio::spawn(async move {
        for _ in 0..ROUNDS {
            reader_view.erase_prefix("own-");
            assert_eq!(reader_view.lookup("never", now), CacheLookup::Miss);
        }
    }));
    for task in tasks {
        task.await.unwrap();
    }

    // Older generations never replace newer ones, so the last word is the newest.
    match view.lookup("shared", now) {
        CacheLookup::Hit(hit) => assert_eq!(hit.generation, Generation(ROUNDS * WRITERS)),
        miss => panic!("expected a hit, got {miss:?}"),
    }
    for w in 0..WRITERS {
        assert_eq!(
            view.lookup(&format!("gone-{w}"), now),
            CacheLookup::NegativeHit
        );
    }
    assert_eq!(other.lookup("shared", now), CacheLookup::Miss);
}
