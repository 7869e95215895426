//! Worker loop: pull one shard, analyze its repositories, persist the result,
//! acknowledge.
//!
//! Per iteration: Pull → CheckExists → (Skip | Process) → Persist → Ack/Nack
//! → PostProcess. The shard is the unit of retry: any unrecoverable error
//! nacks the whole message so another delivery starts from scratch. The
//! existence check on the result key makes redelivery of an already finished
//! shard a no-op.

use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::contract::{ProcessError, RepoAnalyzer};
use crate::data::BatchRequest;
use crate::queue::{QueueError, Subscriber};
use crate::storage::{Bucket, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("result storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to encode results: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("analysis of {repo} failed: {source}")]
    Analysis {
        repo: String,
        #[source]
        source: ProcessError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Log and skip repositories whose analysis fails with a non-skippable
    /// error instead of failing the whole shard.
    pub ignore_runtime_errors: bool,
}

/// How one delivery was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOutcome {
    /// A result already existed for this shard.
    AlreadyDone,
    Written { analyzed: usize, skipped: usize },
}

/// Counters over the lifetime of a [`Worker::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub duplicates: u64,
    pub failed: u64,
}

pub struct Worker {
    subscriber: Box<dyn Subscriber>,
    analyzer: Arc<dyn RepoAnalyzer>,
    results: Bucket,
    raw_results: Option<Bucket>,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        subscriber: Box<dyn Subscriber>,
        analyzer: Arc<dyn RepoAnalyzer>,
        results: Bucket,
        raw_results: Option<Bucket>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            subscriber,
            analyzer,
            results,
            raw_results,
            options,
        }
    }

    /// Loop until the subscriber signals shutdown or pulling fails.
    pub async fn run(&mut self) -> Result<WorkerStats, WorkerError> {
        let mut stats = WorkerStats::default();
        loop {
            let request = match self.subscriber.synchronous_pull().await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    info!("Subscriber signalled shutdown, stopping worker");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Pull failed, stopping worker");
                    self.close_subscriber().await;
                    return Err(e.into());
                }
            };

            let span = info_span!("shard", job_time = %request.job_time, shard_num = request.shard_num);
            self.settle(&request, &mut stats).instrument(span).await;
        }
        self.close_subscriber().await;
        info!(
            processed = stats.processed,
            duplicates = stats.duplicates,
            failed = stats.failed,
            "Worker finished"
        );
        Ok(stats)
    }

    /// Handle one delivery and ack or nack it.
    async fn settle(&mut self, request: &BatchRequest, stats: &mut WorkerStats) {
        match self.handle(request).await {
            Ok(outcome) => {
                match outcome {
                    ShardOutcome::AlreadyDone => stats.duplicates += 1,
                    ShardOutcome::Written { .. } => stats.processed += 1,
                }
                if let Err(e) = self.subscriber.ack().await {
                    // the result is durable; a redelivery will hit the existence check
                    warn!(error = %e, "Ack failed");
                }
                self.analyzer.post_process().await;
            }
            Err(e) => {
                error!(error = %e, "Shard failed, releasing it for redelivery");
                stats.failed += 1;
                if let Err(e) = self.subscriber.nack().await {
                    warn!(error = %e, "Nack failed, message will be redelivered after its deadline");
                }
            }
        }
    }

    async fn close_subscriber(&mut self) {
        if let Err(e) = self.subscriber.close().await {
            warn!(error = %e, "Closing subscriber failed");
        }
    }

    /// Process one delivery without acknowledging it.
    pub async fn handle(&self, request: &BatchRequest) -> Result<ShardOutcome, WorkerError> {
        let key = request.result_key();
        if self.results.exists(&key).await? {
            info!(key = %key, "Shard result already exists, skipping");
            return Ok(ShardOutcome::AlreadyDone);
        }

        let mut rows = Vec::new();
        let mut raw_rows = Vec::new();
        let mut skipped = 0;
        for repo in &request.repos {
            match self.analyzer.process(repo).await {
                Ok(output) => {
                    serde_json::to_writer(&mut rows, &output.result)?;
                    rows.push(b'\n');
                    serde_json::to_writer(&mut raw_rows, output.raw.as_ref().unwrap_or(&output.result))?;
                    raw_rows.push(b'\n');
                }
                Err(e) if e.is_skippable() => {
                    warn!(repo = %repo.url, error = %e, "Skipping repository");
                    skipped += 1;
                }
                Err(e) if self.options.ignore_runtime_errors => {
                    error!(repo = %repo.url, error = %e, "Analysis failed, ignoring as configured");
                    skipped += 1;
                }
                Err(e) => {
                    return Err(WorkerError::Analysis {
                        repo: repo.url.clone(),
                        source: e,
                    })
                }
            }
        }

        // the primary result is the completion signal, so it goes last
        if let Some(raw) = &self.raw_results {
            raw.write(&key, raw_rows).await?;
            debug!(bucket = %raw.url(), key = %key, "Wrote raw shard result");
        }
        self.results.write(&key, rows).await?;
        let analyzed = request.repos.len() - skipped;
        info!(key = %key, analyzed, skipped, "Wrote shard result");
        Ok(ShardOutcome::Written { analyzed, skipped })
    }
}
