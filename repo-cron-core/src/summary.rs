//! Bucket summarizer: group a result bucket's objects by job and tell which
//! jobs are complete.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::data::{parse_blob_key, ShardMetadata, SHARD_METADATA_FILENAME, SHARD_PREFIX, TRANSFER_STATUS_FILENAME};
use crate::storage::{Bucket, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("listing bucket failed: {0}")]
    Storage(#[from] StorageError),
}

/// Everything the bucket holds for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobGroup {
    /// Shard count announced by the metadata object, 0 until it exists.
    pub expected: i32,
    /// Shard result objects found.
    pub created: i32,
    pub transferred: bool,
    /// Raw bytes of the metadata object.
    pub metadata: Vec<u8>,
}

impl JobGroup {
    pub fn is_completed(&self, threshold: f64) -> bool {
        is_completed(self.expected, self.created, threshold)
    }
}

/// A job is complete once at least `threshold` of its announced shards have
/// results. A job without metadata is never complete.
pub fn is_completed(expected: i32, created: i32, threshold: f64) -> bool {
    expected > 0 && f64::from(created) / f64::from(expected) >= threshold
}

/// Jobs in a bucket, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketSummary {
    pub groups: BTreeMap<DateTime<Utc>, JobGroup>,
}

impl BucketSummary {
    pub fn get(&self, job_time: &DateTime<Utc>) -> Option<&JobGroup> {
        self.groups.get(job_time)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Completed jobs that were not loaded yet.
    pub fn pending_transfers(&self, threshold: f64) -> impl Iterator<Item = (&DateTime<Utc>, &JobGroup)> {
        self.groups
            .iter()
            .filter(move |(_, group)| !group.transferred && group.is_completed(threshold))
    }

    fn record(&mut self, job_time: DateTime<Utc>, name: &str, contents: Option<Vec<u8>>) {
        let group = self.groups.entry(job_time).or_default();
        if name.starts_with(SHARD_PREFIX) {
            group.created += 1;
        } else if name == TRANSFER_STATUS_FILENAME {
            group.transferred = true;
        } else if name == SHARD_METADATA_FILENAME {
            let contents = contents.unwrap_or_default();
            match serde_json::from_slice::<ShardMetadata>(&contents) {
                Ok(metadata) => group.expected = metadata.num_shard,
                Err(e) => warn!(job_time = %job_time, error = %e, "Ignoring unreadable shard metadata"),
            }
            group.metadata = contents;
        }
    }
}

/// List `bucket` and build its [`BucketSummary`]. Objects that do not follow
/// the key layout are logged and ignored.
pub async fn summarize(bucket: &Bucket) -> Result<BucketSummary, SummaryError> {
    let mut summary = BucketSummary::default();
    let mut ignored = 0usize;
    for key in bucket.list_keys(None).await? {
        let (job_time, name) = match parse_blob_key(&key) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Ignoring object");
                ignored += 1;
                continue;
            }
        };
        if name == SHARD_METADATA_FILENAME {
            let contents = bucket.read(&key).await?;
            summary.record(job_time, &name, Some(contents.to_vec()));
        } else if name.starts_with(SHARD_PREFIX) || name == TRANSFER_STATUS_FILENAME {
            summary.record(job_time, &name, None);
        } else {
            warn!(key = %key, "Ignoring object with unknown name");
            ignored += 1;
        }
    }

    for (job_time, group) in &summary.groups {
        debug!(
            job_time = %job_time,
            expected = group.expected,
            created = group.created,
            transferred = group.transferred,
            "Job group"
        );
    }
    info!(bucket = %bucket.url(), jobs = summary.len(), ignored, "Summarized bucket");
    Ok(summary)
}
