use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use repo_cron_core::controller::{publish_shards, write_shard_metadata, ControllerError};
use repo_cron_core::data::{blob_key, RepositoryDescriptor, ShardMetadata, SHARD_METADATA_FILENAME};
use repo_cron_core::input::{InputError, InputItem};
use repo_cron_core::queue::{MockPublisher, QueueError};
use repo_cron_core::storage::Bucket;

fn repos(n: usize) -> Vec<InputItem> {
    (0..n)
        .map(|i| Ok(RepositoryDescriptor::new(format!("github.com/o/r{i}"))))
        .collect()
}

/// A publisher mock that records every shard as `(shard_num, size)`.
fn recording_publisher() -> (MockPublisher, Arc<Mutex<Vec<(i32, usize)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut publisher = MockPublisher::new();
    let sink = seen.clone();
    publisher.expect_publish().returning(move |req| {
        sink.lock().unwrap().push((req.shard_num, req.repos.len()));
        Ok(())
    });
    publisher.expect_close().times(1).returning(|| Ok(()));
    (publisher, seen)
}

#[tokio::test]
async fn test_partial_last_shard_is_published() {
    let job_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let (mut publisher, seen) = recording_publisher();

    let summary = publish_shards(repos(5).into_iter(), &mut publisher, 2, job_time)
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(0, 2), (1, 2), (2, 1)]);
    assert_eq!(summary.shard_count, 3);
    assert_eq!(summary.repo_count, 5);
}

#[tokio::test]
async fn test_exact_multiple_suppresses_empty_trailing_shard() {
    let job_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let (mut publisher, seen) = recording_publisher();

    let summary = publish_shards(repos(4).into_iter(), &mut publisher, 2, job_time)
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(0, 2), (1, 2)]);
    assert_eq!(summary.shard_count, 2);
}

#[tokio::test]
async fn test_rejected_rows_are_counted_not_published() {
    let job_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let (mut publisher, seen) = recording_publisher();
    let mut items = repos(3);
    items.insert(
        1,
        Err(InputError::InvalidUrl {
            repo: "nope".into(),
            reason: "expected <owner>/<repo> path".into(),
        }),
    );

    let summary = publish_shards(items.into_iter(), &mut publisher, 10, job_time)
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(0, 3)]);
    assert_eq!(summary.rejected_rows, 1);
    assert_eq!(summary.shard_count, 1);
}

#[tokio::test]
async fn test_close_error_is_propagated() {
    let job_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().returning(|_| Ok(()));
    publisher
        .expect_close()
        .returning(|| Err(QueueError::PublishFailed { failed: 1, total: 2 }));

    let err = publish_shards(repos(3).into_iter(), &mut publisher, 2, job_time)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Publish(QueueError::PublishFailed { failed: 1, total: 2 })
    ));
}

#[tokio::test]
async fn test_zero_shard_size_is_rejected() {
    let job_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let mut publisher = MockPublisher::new();
    let err = publish_shards(repos(1).into_iter(), &mut publisher, 0, job_time)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::InvalidShardSize));
}

#[tokio::test]
async fn test_shard_metadata_copies_differ_only_in_location() {
    let job_time = Utc.with_ymd_and_hms(2024, 1, 2, 15, 4, 5).unwrap();
    let results = Bucket::open("mem://results").unwrap();
    let raw = Bucket::open("mem://raw-results").unwrap();

    let written = write_shard_metadata(&results, Some(&raw), job_time, 3, "v1.2.3")
        .await
        .unwrap();
    assert_eq!(written.shard_loc, "mem://results/2024.01.02/150405/");

    let key = blob_key(SHARD_METADATA_FILENAME, job_time);
    let primary: ShardMetadata = serde_json::from_slice(&results.read(&key).await.unwrap()).unwrap();
    let copy: ShardMetadata = serde_json::from_slice(&raw.read(&key).await.unwrap()).unwrap();

    assert_eq!(primary, written);
    assert_eq!(copy.num_shard, 3);
    assert_eq!(copy.commit_sha, "v1.2.3");
    assert_eq!(copy.shard_loc, "mem://raw-results/2024.01.02/150405/");
}
