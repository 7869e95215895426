//! Controller: split the repository list into shards, publish them, and
//! record how many shards the job has.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::data::{blob_key, BatchRequest, ShardMetadata, SHARD_METADATA_FILENAME};
use crate::input::InputItem;
use crate::queue::{Publisher, QueueError};
use crate::storage::{Bucket, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("shard size must be at least 1")]
    InvalidShardSize,
    #[error("publishing shards failed: {0}")]
    Publish(#[from] QueueError),
    #[error("writing shard metadata failed: {0}")]
    Storage(#[from] StorageError),
    #[error("encoding shard metadata failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What one controller run published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSummary {
    pub job_time: DateTime<Utc>,
    pub shard_count: i32,
    pub repo_count: usize,
    pub rejected_rows: usize,
}

/// Publish `repos` as shards of at most `shard_size` repositories, then close
/// the publisher. Rows the input reports as errors are logged and skipped.
pub async fn publish_shards<I, P>(
    repos: I,
    publisher: &mut P,
    shard_size: usize,
    job_time: DateTime<Utc>,
) -> Result<PublishSummary, ControllerError>
where
    I: Iterator<Item = InputItem>,
    P: Publisher + ?Sized,
{
    if shard_size == 0 {
        return Err(ControllerError::InvalidShardSize);
    }
    let mut shard_num: i32 = 0;
    let mut batch = BatchRequest::new(job_time, shard_num);
    let mut repo_count = 0;
    let mut rejected_rows = 0;

    for item in repos {
        match item {
            Ok(repo) => {
                repo_count += 1;
                batch.repos.push(repo);
            }
            Err(e) => {
                warn!(error = %e, "Skipping input row");
                rejected_rows += 1;
                continue;
            }
        }
        if batch.repos.len() >= shard_size {
            publisher.publish(&batch)?;
            shard_num += 1;
            batch = BatchRequest::new(job_time, shard_num);
        }
    }
    if batch.repos.is_empty() {
        // nothing left over: the last shard number was never used
        shard_num -= 1;
    } else {
        publisher.publish(&batch)?;
    }

    publisher.close().await?;

    let summary = PublishSummary {
        job_time,
        shard_count: shard_num + 1,
        repo_count,
        rejected_rows,
    };
    info!(
        job_time = %job_time,
        shards = summary.shard_count,
        repos = repo_count,
        rejected = rejected_rows,
        "Published all shards"
    );
    Ok(summary)
}

/// Write the job's [`ShardMetadata`] to the result bucket and, when given, a
/// copy to the raw-result bucket pointing at the raw location.
pub async fn write_shard_metadata(
    results: &Bucket,
    raw_results: Option<&Bucket>,
    job_time: DateTime<Utc>,
    shard_count: i32,
    build_version: &str,
) -> Result<ShardMetadata, ControllerError> {
    let job_dir = blob_key("", job_time);
    let key = blob_key(SHARD_METADATA_FILENAME, job_time);
    let metadata = ShardMetadata {
        num_shard: shard_count,
        shard_loc: format!("{}/{}", results.url(), job_dir),
        commit_sha: build_version.to_string(),
    };
    results.write(&key, serde_json::to_vec(&metadata)?).await?;
    info!(bucket = %results.url(), key = %key, shards = shard_count, "Wrote shard metadata");

    if let Some(raw) = raw_results {
        let raw_metadata = ShardMetadata {
            shard_loc: format!("{}/{}", raw.url(), job_dir),
            ..metadata.clone()
        };
        raw.write(&key, serde_json::to_vec(&raw_metadata)?).await?;
        info!(bucket = %raw.url(), key = %key, "Wrote raw shard metadata");
    }
    Ok(metadata)
}
