//! Completion-triggered transfer: load every finished, not yet loaded job of a
//! result bucket into the warehouse, mark it, and announce it.
//!
//! The pass is stateless and safe to repeat. A load overwrites its whole
//! partition, and a job whose load failed keeps no marker so the next pass
//! tries again.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::contract::{LoadRequest, Warehouse, Webhook};
use crate::data::{blob_key, SHARD_PREFIX, TRANSFER_STATUS_FILENAME};
use crate::storage::Bucket;
use crate::summary::{summarize, BucketSummary, SummaryError};

/// Jobs handled by one [`transfer`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub transferred: Vec<DateTime<Utc>>,
    pub failed: Vec<DateTime<Utc>>,
}

impl TransferReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Wildcard URI matching every shard result of the job.
pub fn shard_source_uri(bucket: &Bucket, job_time: DateTime<Utc>) -> String {
    format!("{}/{}{}*", bucket.url(), blob_key("", job_time), SHARD_PREFIX)
}

/// Summarize `bucket` and transfer its pending jobs.
pub async fn transfer(
    bucket: &Bucket,
    warehouse: &dyn Warehouse,
    webhook: Option<&dyn Webhook>,
    threshold: f64,
) -> Result<TransferReport, SummaryError> {
    let summary = summarize(bucket).await?;
    Ok(transfer_summary(bucket, &summary, warehouse, webhook, threshold).await)
}

/// Transfer the pending jobs of an existing summary.
pub async fn transfer_summary(
    bucket: &Bucket,
    summary: &BucketSummary,
    warehouse: &dyn Warehouse,
    webhook: Option<&dyn Webhook>,
    threshold: f64,
) -> TransferReport {
    let mut report = TransferReport::default();
    for (job_time, group) in summary.pending_transfers(threshold) {
        let job_time = *job_time;
        let request = LoadRequest {
            source_uri: shard_source_uri(bucket, job_time),
            partition: job_time.date_naive(),
            job_time,
        };
        info!(
            job_time = %job_time,
            source = %request.source_uri,
            shards = group.created,
            expected = group.expected,
            "Loading job"
        );
        if let Err(e) = warehouse.load_partition(request).await {
            error!(job_time = %job_time, error = %e, "Load failed, job will be retried on the next pass");
            report.failed.push(job_time);
            continue;
        }

        let marker = blob_key(TRANSFER_STATUS_FILENAME, job_time);
        if let Err(e) = bucket.write(&marker, Vec::new()).await {
            // the load is repeatable, so the next pass simply reloads
            error!(job_time = %job_time, key = %marker, error = %e, "Writing transfer marker failed");
            report.failed.push(job_time);
            continue;
        }
        report.transferred.push(job_time);

        if let Some(webhook) = webhook {
            if let Err(e) = webhook.notify(group.metadata.clone()).await {
                warn!(job_time = %job_time, error = %e, "Webhook notification failed");
            }
        }
    }
    info!(
        bucket = %bucket.url(),
        transferred = report.transferred.len(),
        failed = report.failed.len(),
        "Transfer pass finished"
    );
    report
}
