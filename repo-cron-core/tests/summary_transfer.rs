use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use repo_cron_core::contract::{LoadRequest, MockWarehouse, MockWebhook};
use repo_cron_core::controller::write_shard_metadata;
use repo_cron_core::data::{blob_key, shard_filename, TRANSFER_STATUS_FILENAME};
use repo_cron_core::storage::Bucket;
use repo_cron_core::summary::{is_completed, summarize};
use repo_cron_core::transfer::transfer;

fn job(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, hour, 4, 5).unwrap()
}

/// Write `expected` as the job's shard count and `created` shard results.
async fn seed(bucket: &Bucket, job_time: DateTime<Utc>, expected: i32, created: i32) {
    write_shard_metadata(bucket, None, job_time, expected, "test")
        .await
        .unwrap();
    for shard in 0..created {
        bucket
            .write(&blob_key(&shard_filename(shard), job_time), b"{}\n".to_vec())
            .await
            .unwrap();
    }
}

#[test]
fn test_is_completed_threshold_boundaries() {
    assert!(is_completed(10, 9, 0.9));
    assert!(!is_completed(10, 8, 0.9));
    assert!(is_completed(2, 2, 1.0));
    assert!(!is_completed(0, 5, 0.0));
    assert!(is_completed(4, 0, 0.0));
}

#[test]
fn test_is_completed_reference_cases() {
    for threshold in [0.0, 0.1, 0.5, 0.9, 1.0] {
        assert!(!is_completed(0, 0, threshold), "threshold {threshold}");
    }
    assert!(is_completed(2, 2, 0.5));
    assert!(is_completed(10, 1, 0.1));
    assert!(!is_completed(10, 0, 0.1));
}

#[tokio::test]
async fn test_summarize_groups_by_job_and_ignores_strays() {
    let bucket = Bucket::open("mem://results").unwrap();
    seed(&bucket, job(10), 3, 2).await;
    seed(&bucket, job(11), 1, 1).await;
    bucket
        .write(&blob_key(TRANSFER_STATUS_FILENAME, job(11)), Vec::new())
        .await
        .unwrap();
    bucket.write("README.md", b"hello".to_vec()).await.unwrap();
    bucket
        .write(&blob_key("unexpected.txt", job(10)), b"x".to_vec())
        .await
        .unwrap();

    let summary = summarize(&bucket).await.unwrap();

    assert_eq!(summary.len(), 2);
    let first = summary.get(&job(10)).unwrap();
    assert_eq!((first.expected, first.created, first.transferred), (3, 2, false));
    assert!(!first.metadata.is_empty());
    let second = summary.get(&job(11)).unwrap();
    assert_eq!((second.expected, second.created, second.transferred), (1, 1, true));
    let keys: Vec<_> = summary.groups.keys().copied().collect();
    assert_eq!(keys, vec![job(10), job(11)]);
}

#[tokio::test]
async fn test_transfer_loads_completed_jobs_once() {
    let bucket = Bucket::open("mem://results").unwrap();
    seed(&bucket, job(10), 2, 2).await;
    seed(&bucket, job(12), 4, 1).await;

    let loads = Arc::new(Mutex::new(Vec::<LoadRequest>::new()));
    let recorded = loads.clone();
    let mut warehouse = MockWarehouse::new();
    warehouse.expect_load_partition().times(1).returning(move |req| {
        recorded.lock().unwrap().push(req);
        Ok(())
    });
    let mut webhook = MockWebhook::new();
    webhook
        .expect_notify()
        .times(1)
        .withf(|payload| String::from_utf8_lossy(payload).contains("\"num_shard\":2"))
        .returning(|_| Ok(()));

    let report = transfer(&bucket, &warehouse, Some(&webhook), 1.0).await.unwrap();

    assert_eq!(report.transferred, vec![job(10)]);
    assert!(report.failed.is_empty());
    let loads = loads.lock().unwrap();
    assert_eq!(loads[0].source_uri, "mem://results/2024.01.02/100405/shard-*");
    assert_eq!(loads[0].partition, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    assert!(bucket
        .exists(&blob_key(TRANSFER_STATUS_FILENAME, job(10)))
        .await
        .unwrap());

    // the marker keeps the next pass from loading again
    let mut idle = MockWarehouse::new();
    idle.expect_load_partition().never();
    let again = transfer(&bucket, &idle, None, 1.0).await.unwrap();
    assert!(again.transferred.is_empty());
}

#[tokio::test]
async fn test_failed_load_writes_no_marker_and_is_retried() {
    let bucket = Bucket::open("mem://results").unwrap();
    seed(&bucket, job(10), 1, 1).await;

    let mut failing = MockWarehouse::new();
    failing
        .expect_load_partition()
        .times(1)
        .returning(|_| Err("quota exceeded".into()));
    let mut webhook = MockWebhook::new();
    webhook.expect_notify().never();

    let report = transfer(&bucket, &failing, Some(&webhook), 0.5).await.unwrap();
    assert_eq!(report.failed, vec![job(10)]);
    assert!(report.has_failures());
    assert!(!bucket
        .exists(&blob_key(TRANSFER_STATUS_FILENAME, job(10)))
        .await
        .unwrap());

    let mut working = MockWarehouse::new();
    working.expect_load_partition().times(1).returning(|_| Ok(()));
    let retried = transfer(&bucket, &working, None, 0.5).await.unwrap();
    assert_eq!(retried.transferred, vec![job(10)]);
}

#[tokio::test]
async fn test_webhook_failure_does_not_fail_transfer() {
    let bucket = Bucket::open("mem://results").unwrap();
    seed(&bucket, job(10), 1, 1).await;

    let mut warehouse = MockWarehouse::new();
    warehouse.expect_load_partition().returning(|_| Ok(()));
    let mut webhook = MockWebhook::new();
    webhook
        .expect_notify()
        .times(1)
        .returning(|_| Err("connection refused".into()));

    let report = transfer(&bucket, &warehouse, Some(&webhook), 1.0).await.unwrap();
    assert_eq!(report.transferred, vec![job(10)]);
    assert!(!report.has_failures());
}
