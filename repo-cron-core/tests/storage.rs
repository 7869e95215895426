use repo_cron_core::storage::{Bucket, StorageError};
use tempfile::tempdir;

#[tokio::test]
async fn test_root_prefix_is_hidden_from_keys() {
    let bucket = Bucket::open("mem://results/prod/").unwrap();
    assert_eq!(bucket.url(), "mem://results/prod");

    assert!(!bucket.exists("2024.01.02/150405/shard-0000000").await.unwrap());
    bucket
        .write("2024.01.02/150405/shard-0000000", b"{}\n".to_vec())
        .await
        .unwrap();
    assert!(bucket.exists("2024.01.02/150405/shard-0000000").await.unwrap());
    assert_eq!(
        bucket.list_keys(None).await.unwrap(),
        vec!["2024.01.02/150405/shard-0000000".to_string()]
    );
    assert_eq!(
        bucket.read("2024.01.02/150405/shard-0000000").await.unwrap().as_ref(),
        b"{}\n"
    );
}

#[tokio::test]
async fn test_file_bucket_writes_below_directory() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("results");
    let bucket = Bucket::open(&format!("file://{}", root.display())).unwrap();

    bucket.write("2024.01.02/150405/shard-0000000", b"{}\n".to_vec()).await.unwrap();

    assert!(root.join("2024.01.02/150405/shard-0000000").is_file());
    assert_eq!(
        bucket.list_keys(Some("2024.01.02")).await.unwrap(),
        vec!["2024.01.02/150405/shard-0000000".to_string()]
    );
}

#[test]
fn test_unsupported_scheme_is_rejected() {
    assert!(matches!(
        Bucket::open("ftp://results"),
        Err(StorageError::InvalidUrl { .. })
    ));
    assert!(matches!(Bucket::open("not a url"), Err(StorageError::InvalidUrl { .. })));
}
